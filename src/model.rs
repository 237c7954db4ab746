use candle_core::{DType, Device, Tensor, Var};
use serde_json::json;

use crate::{params::RunConfig, TrainError};

/// A trainable model: exposes its parameters by name and computes a scalar
/// loss from a feature/label batch. Parameter order must be deterministic
/// across calls and across replicas.
pub trait SeqModel {
    fn named_parameters(&self) -> Vec<(String, Var)>;
    fn loss(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor, TrainError>;
}

/// Zero-initialized linear regressor with squared-error loss. Small enough
/// to exercise the full training loop end to end.
pub struct LinearModel {
    weight: Var,
    bias: Var,
}

impl LinearModel {
    pub fn new(hidden_size: usize, device: &Device) -> Result<Self, TrainError> {
        let weight = Var::zeros((hidden_size, 1), DType::F32, device)
            .map_err(|err| TrainError::runtime(err.to_string()))?;
        let bias = Var::zeros(1, DType::F32, device)
            .map_err(|err| TrainError::runtime(err.to_string()))?;
        Ok(Self { weight, bias })
    }
}

impl SeqModel for LinearModel {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("linear/weight".to_string(), self.weight.clone()),
            ("linear/bias".to_string(), self.bias.clone()),
        ]
    }

    fn loss(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor, TrainError> {
        let prediction = features
            .matmul(self.weight.as_tensor())
            .map_err(to_runtime_error)?
            .broadcast_add(self.bias.as_tensor())
            .map_err(to_runtime_error)?;
        prediction
            .sub(labels)
            .map_err(to_runtime_error)?
            .sqr()
            .map_err(to_runtime_error)?
            .mean_all()
            .map_err(to_runtime_error)
    }
}

/// Instantiate a registered model by name.
pub fn get_model(
    name: &str,
    config: &RunConfig,
    device: &Device,
) -> Result<Box<dyn SeqModel>, TrainError> {
    match name {
        "linear" => {
            let hidden_size = config.get_usize("hidden_size")?;
            Ok(Box::new(LinearModel::new(hidden_size, device)?))
        }
        other => Err(TrainError::config(format!("unknown model '{}'", other))),
    }
}

/// Model-specific hyper-parameter defaults, merged over the global defaults
/// before user overrides apply.
pub fn model_defaults(name: &str) -> Result<RunConfig, TrainError> {
    match name {
        "linear" => {
            let mut config = RunConfig::default();
            config.set("hidden_size", json!(4));
            Ok(config)
        }
        other => Err(TrainError::config(format!("unknown model '{}'", other))),
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}
