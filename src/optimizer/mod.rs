use std::collections::HashMap;

pub mod scaler;

pub use scaler::{LossScaleConfig, LossScaler, ScalerState};

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{params::RunConfig, schedule::Schedule, TrainError};

const EPS: f64 = 1e-12;

/// Update pipeline applied once per optimizer step: schedule, gradient
/// clipping, the base update rule, loss scaling, and micro-batch
/// accumulation, composed in a fixed order.
pub struct OptimizerPipeline {
    schedule: Schedule,
    clipper: Clipper,
    rule: RuleKind,
    slots: HashMap<String, RuleSlot>,
    scaler: LossScaler,
    update_cycle: usize,
    micro_batches: usize,
    pending: HashMap<String, Tensor>,
    updates: usize,
    device: Device,
}

#[derive(Debug, Clone)]
enum Clipper {
    None,
    GlobalNorm { threshold: f64 },
    /// Clips each gradient to its own running-average norm.
    Adaptive { rho: f64, norms: HashMap<String, f64> },
}

#[derive(Debug, Clone, Copy)]
enum RuleKind {
    Adam { beta1: f64, beta2: f64, epsilon: f64 },
    Adadelta { rho: f64, epsilon: f64 },
    Sgd,
}

/// Per-parameter accumulator state for rules that carry moments.
struct RuleSlot {
    shape: Vec<usize>,
    first: Tensor,
    second: Tensor,
}

/// Result of feeding one micro-batch of gradients into the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Accumulated; the update cycle is not complete yet.
    Accumulating,
    Applied { learning_rate: f64, grad_norm: f64 },
    /// The cycle completed but gradients overflowed; the update was dropped
    /// and the loss scale backed off.
    SkippedOverflow,
}

impl OptimizerPipeline {
    pub fn from_config(
        config: &RunConfig,
        world_size: usize,
        device: &Device,
    ) -> Result<Self, TrainError> {
        let schedule = Schedule::from_config(config, world_size)?;

        let clipper = match config.get_str("clipping")?.to_ascii_lowercase().as_str() {
            "none" | "" => Clipper::None,
            "global_norm" => Clipper::GlobalNorm {
                threshold: config.get_f64("clip_grad_norm")?,
            },
            "adaptive" => Clipper::Adaptive {
                rho: config.get_f64("adaptive_clip_rho")?,
                norms: HashMap::new(),
            },
            other => {
                return Err(TrainError::config(format!(
                    "unknown gradient clipper '{}'",
                    other
                )))
            }
        };

        let rule = match config.get_str("optimizer")?.to_ascii_lowercase().as_str() {
            "adam" => RuleKind::Adam {
                beta1: config.get_f64("adam_beta1")?,
                beta2: config.get_f64("adam_beta2")?,
                epsilon: config.get_f64("adam_epsilon")?,
            },
            "adadelta" => RuleKind::Adadelta {
                rho: config.get_f64("adadelta_rho")?,
                epsilon: config.get_f64("adadelta_epsilon")?,
            },
            "sgd" => RuleKind::Sgd,
            other => {
                return Err(TrainError::config(format!(
                    "unknown optimizer '{}'",
                    other
                )))
            }
        };

        let update_cycle = config.get_usize("update_cycle")?;
        if update_cycle == 0 {
            return Err(TrainError::config("update_cycle must be at least 1"));
        }

        Ok(Self {
            schedule,
            clipper,
            rule,
            slots: HashMap::new(),
            scaler: LossScaler::new(config.get_bool("half")?),
            update_cycle,
            micro_batches: 0,
            pending: HashMap::new(),
            updates: 0,
            device: device.clone(),
        })
    }

    pub fn update_cycle(&self) -> usize {
        self.update_cycle
    }

    /// Total micro-batches fed so far; `micro_batches % update_cycle` is the
    /// position within the current accumulation cycle.
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Backward pass. Returns one fp32 gradient per entry of `named`, in
    /// order, with zeros for parameters the loss does not reach.
    pub fn compute_gradients(
        &self,
        loss: &Tensor,
        named: &[(String, Var)],
    ) -> Result<Vec<Tensor>, TrainError> {
        let scaled = self.scaler.scale(loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;

        let mut out = Vec::with_capacity(named.len());
        for (_, var) in named {
            let grad = match grads.remove(var.as_tensor()) {
                Some(grad) => self
                    .scaler
                    .unscale(&grad.to_dtype(DType::F32).map_err(to_runtime_error)?)?,
                None => Tensor::zeros(var.as_tensor().dims(), DType::F32, &self.device)
                    .map_err(to_runtime_error)?,
            };
            out.push(grad);
        }
        Ok(out)
    }

    /// Feed one micro-batch of (gradient, parameter) pairs. Parameters are
    /// only touched when this call completes an update cycle; `step` is the
    /// global step the schedule is evaluated at.
    pub fn apply_gradients(
        &mut self,
        step: usize,
        pairs: Vec<(Tensor, (String, Var))>,
    ) -> Result<ApplyOutcome, TrainError> {
        let mut vars = Vec::with_capacity(pairs.len());
        for (grad, (name, var)) in pairs {
            match self.pending.remove(&name) {
                Some(previous) => {
                    let summed = previous.add(&grad).map_err(to_runtime_error)?;
                    self.pending.insert(name.clone(), summed);
                }
                None => {
                    self.pending.insert(name.clone(), grad);
                }
            }
            vars.push((name, var));
        }

        self.micro_batches += 1;
        if self.micro_batches % self.update_cycle != 0 {
            return Ok(ApplyOutcome::Accumulating);
        }

        let scale = 1.0 / self.update_cycle as f64;
        let mut grads = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            let Some(summed) = self.pending.remove(&name) else {
                continue;
            };
            let averaged = summed.affine(scale, 0.0).map_err(to_runtime_error)?;
            grads.push((name, var, averaged));
        }
        self.pending.clear();

        if self
            .scaler
            .has_overflow(grads.iter().map(|(_, _, grad)| grad))?
        {
            self.scaler.update(true);
            return Ok(ApplyOutcome::SkippedOverflow);
        }
        self.scaler.update(false);

        let grad_norm = self.clip(&mut grads)?;
        let learning_rate = self.schedule.rate(step);
        self.updates += 1;

        match self.rule {
            RuleKind::Adam {
                beta1,
                beta2,
                epsilon,
            } => self.step_adam(learning_rate, beta1, beta2, epsilon, &grads)?,
            RuleKind::Adadelta { rho, epsilon } => {
                self.step_adadelta(learning_rate, rho, epsilon, &grads)?
            }
            RuleKind::Sgd => self.step_sgd(learning_rate, &grads)?,
        }

        Ok(ApplyOutcome::Applied {
            learning_rate,
            grad_norm,
        })
    }

    /// Apply the configured clipper in place and return the pre-clip global
    /// norm.
    fn clip(&mut self, grads: &mut [(String, Var, Tensor)]) -> Result<f64, TrainError> {
        let mut norms = Vec::with_capacity(grads.len());
        for (_, _, grad) in grads.iter() {
            norms.push(tensor_l2_norm(grad)?);
        }
        let global_norm = norms.iter().map(|n| n * n).sum::<f64>().sqrt();

        match &mut self.clipper {
            Clipper::None => {}
            Clipper::GlobalNorm { threshold } => {
                if global_norm > *threshold {
                    let scale = *threshold / (global_norm + EPS);
                    for (_, _, grad) in grads.iter_mut() {
                        *grad = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                    }
                }
            }
            Clipper::Adaptive { rho, norms: avgs } => {
                for ((name, _, grad), norm) in grads.iter_mut().zip(&norms) {
                    let mut norm = *norm;
                    if let Some(avg) = avgs.get(name) {
                        if norm > *avg {
                            let scale = *avg / (norm + EPS);
                            *grad = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                            norm = *avg;
                        }
                    }
                    let avg = avgs.entry(name.clone()).or_insert(norm);
                    *avg = *rho * *avg + (1.0 - *rho) * norm;
                }
            }
        }

        Ok(global_norm)
    }

    fn step_adam(
        &mut self,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        grads: &[(String, Var, Tensor)],
    ) -> Result<(), TrainError> {
        let t = self.updates as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for (name, var, grad) in grads {
            let slot = slot_for(&mut self.slots, name, var, &self.device)?;

            let new_m = slot
                .first
                .affine(beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second
                .affine(beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let next = var
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .sub(&update)
                .map_err(to_runtime_error)?;
            set_param(var, next)?;

            slot.first = new_m;
            slot.second = new_v;
        }
        Ok(())
    }

    fn step_adadelta(
        &mut self,
        learning_rate: f64,
        rho: f64,
        epsilon: f64,
        grads: &[(String, Var, Tensor)],
    ) -> Result<(), TrainError> {
        for (name, var, grad) in grads {
            let slot = slot_for(&mut self.slots, name, var, &self.device)?;

            let grad_avg = slot
                .first
                .affine(rho, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - rho, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let numerator = slot
                .second
                .affine(1.0, epsilon)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?;
            let denominator = grad_avg
                .affine(1.0, epsilon)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?;
            let update = grad
                .mul(&numerator)
                .map_err(to_runtime_error)?
                .div(&denominator)
                .map_err(to_runtime_error)?;

            let update_avg = slot
                .second
                .affine(rho, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &update
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - rho, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let next = var
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .sub(&update.affine(learning_rate, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            set_param(var, next)?;

            slot.first = grad_avg;
            slot.second = update_avg;
        }
        Ok(())
    }

    fn step_sgd(
        &mut self,
        learning_rate: f64,
        grads: &[(String, Var, Tensor)],
    ) -> Result<(), TrainError> {
        for (_, var, grad) in grads {
            let next = var
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .sub(&grad.affine(learning_rate, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            set_param(var, next)?;
        }
        Ok(())
    }

    pub fn state(&self) -> Result<PipelineState, TrainError> {
        let mut slots = Vec::with_capacity(self.slots.len());
        for (name, slot) in &self.slots {
            let numel: usize = slot.shape.iter().product();
            slots.push(SlotState {
                name: name.clone(),
                shape: slot.shape.clone(),
                first: flatten_to_vec(&slot.first, numel)?,
                second: flatten_to_vec(&slot.second, numel)?,
            });
        }
        slots.sort_by(|a, b| a.name.cmp(&b.name));

        let mut pending = Vec::with_capacity(self.pending.len());
        for (name, grad) in &self.pending {
            let shape = grad.dims().to_vec();
            let numel: usize = shape.iter().product();
            pending.push(PendingState {
                name: name.clone(),
                shape,
                values: flatten_to_vec(grad, numel)?,
            });
        }
        pending.sort_by(|a, b| a.name.cmp(&b.name));

        let mut clipper_norms: Vec<(String, f64)> = match &self.clipper {
            Clipper::Adaptive { norms, .. } => {
                norms.iter().map(|(k, v)| (k.clone(), *v)).collect()
            }
            _ => Vec::new(),
        };
        clipper_norms.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(PipelineState {
            updates: self.updates,
            micro_batches: self.micro_batches,
            scaler: self.scaler.state(),
            clipper_norms,
            slots,
            pending,
        })
    }

    pub fn load_state(&mut self, state: PipelineState) -> Result<(), TrainError> {
        self.updates = state.updates;
        self.micro_batches = state.micro_batches;
        self.scaler.load_state(&state.scaler);

        if let Clipper::Adaptive { norms, .. } = &mut self.clipper {
            norms.clear();
            norms.extend(state.clipper_norms.into_iter());
        }

        self.slots.clear();
        for slot in state.slots {
            let numel: usize = slot.shape.iter().product();
            if slot.first.len() != numel || slot.second.len() != numel {
                return Err(TrainError::restore(format!(
                    "optimizer accumulator size mismatch for '{}'",
                    slot.name
                )));
            }
            let first = tensor_from_vec(slot.first, &slot.shape, &self.device)?;
            let second = tensor_from_vec(slot.second, &slot.shape, &self.device)?;
            self.slots.insert(
                slot.name,
                RuleSlot {
                    shape: slot.shape,
                    first,
                    second,
                },
            );
        }

        self.pending.clear();
        for pending in state.pending {
            let numel: usize = pending.shape.iter().product();
            if pending.values.len() != numel {
                return Err(TrainError::restore(format!(
                    "pending gradient size mismatch for '{}'",
                    pending.name
                )));
            }
            let grad = tensor_from_vec(pending.values, &pending.shape, &self.device)?;
            self.pending.insert(pending.name, grad);
        }
        Ok(())
    }
}

fn slot_for<'a>(
    slots: &'a mut HashMap<String, RuleSlot>,
    name: &str,
    var: &Var,
    device: &Device,
) -> Result<&'a mut RuleSlot, TrainError> {
    if !slots.contains_key(name) {
        let shape = var.as_tensor().dims().to_vec();
        let first =
            Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
        let second =
            Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
        slots.insert(
            name.to_string(),
            RuleSlot {
                shape,
                first,
                second,
            },
        );
    }
    slots
        .get_mut(name)
        .ok_or_else(|| TrainError::runtime(format!("missing optimizer slot for '{}'", name)))
}

fn set_param(var: &Var, next: Tensor) -> Result<(), TrainError> {
    let dtype = var.as_tensor().dtype();
    let cast = if dtype == DType::F32 {
        next
    } else {
        next.to_dtype(dtype).map_err(to_runtime_error)?
    };
    var.set(&cast).map_err(to_runtime_error)
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn tensor_from_vec(
    values: Vec<f32>,
    shape: &[usize],
    device: &Device,
) -> Result<Tensor, TrainError> {
    let numel = values.len();
    Tensor::from_vec(values, numel, device)
        .map_err(to_runtime_error)?
        .reshape(shape)
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}

/// Serializable pipeline state. Accumulators and in-flight gradients are
/// flattened to fp32 vectors and keyed by parameter name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub updates: usize,
    pub micro_batches: usize,
    pub scaler: ScalerState,
    pub clipper_norms: Vec<(String, f64)>,
    pub slots: Vec<SlotState>,
    pub pending: Vec<PendingState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first: Vec<f32>,
    pub second: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingState {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}
