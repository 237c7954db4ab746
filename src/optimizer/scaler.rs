use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::TrainError;

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    /// Clamp every knob into a usable range; a config that cannot shrink or
    /// that starts outside its own bounds would wedge the scale.
    fn sanitized(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(0.0..1.0).contains(&self.backoff_factor) {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        self.max_scale = self.max_scale.max(self.min_scale);
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

/// Dynamic loss scaling for reduced-precision training. Disabled (identity)
/// when the run is full precision.
#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

/// Serializable scaler state, persisted inside the optimizer checkpoint so a
/// resumed run keeps the scale it had converged to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self::with_config(LossScaleConfig::default(), enabled)
    }

    pub fn with_config(config: LossScaleConfig, enabled: bool) -> Self {
        let config = config.sanitized();
        Self {
            enabled,
            loss_scale: if enabled { config.initial_scale } else { 1.0 },
            stable_steps: 0,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn loss_scale(&self) -> f32 {
        if self.enabled {
            self.loss_scale
        } else {
            1.0
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainError> {
        if !self.enabled {
            return Ok(tensor.clone());
        }
        tensor
            .affine(self.loss_scale as f64, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainError> {
        if !self.enabled {
            return Ok(tensor.clone());
        }
        let scale = 1.0 / self.loss_scale;
        tensor.affine(scale as f64, 0.0).map_err(to_runtime_error)
    }

    /// Overflow scan. Summing absolute values folds each tensor into a
    /// single device-to-host read; any inf or nan poisons the sum.
    pub fn has_overflow<'a, I>(&self, tensors: I) -> Result<bool, TrainError>
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        for tensor in tensors {
            if tensor.elem_count() == 0 {
                continue;
            }
            let folded = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.abs())
                .and_then(|t| t.sum_all())
                .and_then(|t| t.to_vec0::<f32>())
                .map_err(to_runtime_error)?;
            if !folded.is_finite() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.loss_scale =
                (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.loss_scale =
                    (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }

    pub fn state(&self) -> ScalerState {
        ScalerState {
            enabled: self.enabled,
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
        }
    }

    pub fn load_state(&mut self, state: &ScalerState) {
        self.enabled = state.enabled;
        self.loss_scale = state.loss_scale.clamp(self.config.min_scale, self.config.max_scale);
        self.stable_steps = state.stable_steps;
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}
