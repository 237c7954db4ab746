use crate::{params::RunConfig, TrainError};

/// Learning-rate schedule, evaluated from the global step. Schedules are pure
/// functions of the step so they cost nothing to persist: a resumed run
/// recomputes the same rate from the restored step counter.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Linear ramp to the peak rate over `warmup_steps`, then decay with the
    /// inverse square root of the step.
    LinearWarmupRsqrtDecay {
        learning_rate: f64,
        initial_learning_rate: f64,
        warmup_steps: f64,
    },
    /// Constant segments separated by step boundaries.
    PiecewiseConstantDecay {
        boundaries: Vec<usize>,
        values: Vec<f64>,
    },
    /// Linear warmup scaled by replica count, then exponential decay back to
    /// the single-replica rate between the decay boundaries.
    LinearExponentialDecay {
        learning_rate: f64,
        warmup_steps: f64,
        start_decay_step: f64,
        end_decay_step: f64,
        world_size: f64,
    },
    Constant { learning_rate: f64 },
}

impl Schedule {
    pub fn from_config(config: &RunConfig, world_size: usize) -> Result<Self, TrainError> {
        let name = config.get_str("learning_rate_schedule")?;
        let learning_rate = config.get_f64("learning_rate")?;

        match name {
            "linear_warmup_rsqrt_decay" => {
                let warmup_steps = config.get_usize("warmup_steps")?.max(1) as f64;
                let mut initial_learning_rate = config.get_f64("initial_learning_rate")?;
                if initial_learning_rate == 0.0 {
                    initial_learning_rate = learning_rate / warmup_steps;
                }
                Ok(Schedule::LinearWarmupRsqrtDecay {
                    learning_rate,
                    initial_learning_rate,
                    warmup_steps,
                })
            }
            "piecewise_constant_decay" => {
                let boundaries = config.get_usize_list("learning_rate_boundaries")?;
                let values = config.get_f64_list("learning_rate_values")?;
                if values.len() != boundaries.len() + 1 {
                    return Err(TrainError::config(format!(
                        "piecewise_constant_decay needs one more value than boundary \
                         (got {} boundaries, {} values)",
                        boundaries.len(),
                        values.len()
                    )));
                }
                if boundaries.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(TrainError::config(
                        "learning_rate_boundaries must be strictly increasing",
                    ));
                }
                Ok(Schedule::PiecewiseConstantDecay { boundaries, values })
            }
            "linear_exponential_decay" => {
                let start_decay_step = config.get_usize("start_decay_step")?;
                let end_decay_step = config.get_usize("end_decay_step")?;
                if end_decay_step <= start_decay_step {
                    return Err(TrainError::config(
                        "end_decay_step must be greater than start_decay_step",
                    ));
                }
                Ok(Schedule::LinearExponentialDecay {
                    learning_rate,
                    warmup_steps: config.get_usize("warmup_steps")?.max(1) as f64,
                    start_decay_step: start_decay_step as f64,
                    end_decay_step: end_decay_step as f64,
                    world_size: world_size.max(1) as f64,
                })
            }
            "constant" => Ok(Schedule::Constant { learning_rate }),
            other => Err(TrainError::config(format!(
                "unknown learning rate schedule '{}'",
                other
            ))),
        }
    }

    pub fn rate(&self, step: usize) -> f64 {
        let step = step as f64;
        match self {
            Schedule::LinearWarmupRsqrtDecay {
                learning_rate,
                initial_learning_rate,
                warmup_steps,
            } => {
                if step <= *warmup_steps {
                    initial_learning_rate
                        + (learning_rate - initial_learning_rate) * step / warmup_steps
                } else {
                    learning_rate * (warmup_steps / step).sqrt()
                }
            }
            Schedule::PiecewiseConstantDecay { boundaries, values } => {
                for (boundary, value) in boundaries.iter().zip(values) {
                    if step <= *boundary as f64 {
                        return *value;
                    }
                }
                values[values.len() - 1]
            }
            Schedule::LinearExponentialDecay {
                learning_rate,
                warmup_steps,
                start_decay_step,
                end_decay_step,
                world_size,
            } => {
                let n = *world_size;
                let p = warmup_steps / n;
                let s = n * start_decay_step;
                let e = n * end_decay_step;
                let linear = 1.0 + step * (n - 1.0) / (n * p);
                let exponential = n * (2.0 * n).powf((s - n * step) / (e - s));
                learning_rate * linear.min(n).min(exponential)
            }
            Schedule::Constant { learning_rate } => *learning_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(pairs: &[(&str, serde_json::Value)]) -> RunConfig {
        let mut config = RunConfig::defaults();
        for (key, value) in pairs {
            config.set(key, value.clone());
        }
        config
    }

    #[test]
    fn rsqrt_ramps_then_decays() {
        let config = config_with(&[
            ("learning_rate", json!(1.0)),
            ("warmup_steps", json!(100)),
        ]);
        let schedule = Schedule::from_config(&config, 1).unwrap();
        assert!(schedule.rate(1) < schedule.rate(50));
        assert!(schedule.rate(50) < schedule.rate(100));
        assert!((schedule.rate(100) - 1.0).abs() < 1e-9);
        assert!((schedule.rate(400) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rsqrt_starts_at_the_initial_rate() {
        let config = config_with(&[
            ("learning_rate", json!(1.0)),
            ("initial_learning_rate", json!(0.5)),
            ("warmup_steps", json!(100)),
        ]);
        let schedule = Schedule::from_config(&config, 1).unwrap();
        assert_eq!(schedule.rate(0), 0.5);
    }

    #[test]
    fn piecewise_selects_segment_by_boundary() {
        let config = config_with(&[
            ("learning_rate_schedule", json!("piecewise_constant_decay")),
            ("learning_rate_boundaries", json!([10, 20])),
            ("learning_rate_values", json!([1.0, 0.5, 0.25])),
        ]);
        let schedule = Schedule::from_config(&config, 1).unwrap();
        assert_eq!(schedule.rate(5), 1.0);
        assert_eq!(schedule.rate(10), 1.0);
        assert_eq!(schedule.rate(11), 0.5);
        assert_eq!(schedule.rate(999), 0.25);
    }

    #[test]
    fn piecewise_rejects_mismatched_lengths() {
        let config = config_with(&[
            ("learning_rate_schedule", json!("piecewise_constant_decay")),
            ("learning_rate_boundaries", json!([10])),
            ("learning_rate_values", json!([1.0])),
        ]);
        assert!(Schedule::from_config(&config, 1).is_err());
    }

    #[test]
    fn linear_exponential_is_capped_at_world_size() {
        let config = config_with(&[
            ("learning_rate_schedule", json!("linear_exponential_decay")),
            ("learning_rate", json!(1.0)),
            ("warmup_steps", json!(40)),
            ("start_decay_step", json!(100)),
            ("end_decay_step", json!(200)),
        ]);
        let schedule = Schedule::from_config(&config, 4).unwrap();
        for step in 0..100 {
            assert!(schedule.rate(step) <= 4.0 + 1e-9);
        }
        assert!(schedule.rate(60) > schedule.rate(1));
    }

    #[test]
    fn unknown_schedule_name_fails() {
        let config = config_with(&[("learning_rate_schedule", json!("cosine"))]);
        let err = Schedule::from_config(&config, 1).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }
}
