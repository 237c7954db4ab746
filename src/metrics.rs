use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Smoothed per-step training statistics.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    loss_ema: ExponentialMovingAverage,
    rate_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            loss_ema: ExponentialMovingAverage::new(0.1),
            rate_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record(&mut self, loss: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        let steps_per_sec = if step_duration > Duration::ZERO {
            1.0 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        StepSnapshot {
            loss,
            loss_ema: self.loss_ema.update(loss),
            steps_per_sec: self.rate_ema.update(steps_per_sec),
            step_duration,
            wall_time: now.duration_since(self.start_time),
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub loss_ema: f64,
    pub steps_per_sec: f64,
    pub step_duration: Duration,
    pub wall_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(0.0), 2.0);
    }

    #[test]
    fn snapshot_tracks_raw_and_smoothed_loss() {
        let mut metrics = TrainingMetrics::new();
        let first = metrics.record(10.0);
        assert_eq!(first.loss, 10.0);
        assert_eq!(first.loss_ema, 10.0);
        let second = metrics.record(0.0);
        assert_eq!(second.loss, 0.0);
        assert!(second.loss_ema > 0.0 && second.loss_ema < 10.0);
    }
}
