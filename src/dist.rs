use std::net::TcpListener;

use candle_core::{DType, Device, Tensor};

use crate::{model::SeqModel, TrainError};

/// Collective communication between replicas. The single-process group is a
/// no-op implementation; multi-process transports plug in behind this trait.
pub trait Collective: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn broadcast(&self, buffer: &mut [f32], root: usize) -> Result<(), TrainError>;
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), TrainError>;
    fn barrier(&self) -> Result<(), TrainError>;
}

/// Degenerate single-replica collective.
pub struct LocalGroup;

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, _buffer: &mut [f32], _root: usize) -> Result<(), TrainError> {
        Ok(())
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<(), TrainError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainError> {
        Ok(())
    }
}

/// One replica's view of the training run: its rank, the device it trains
/// on, and the collective it synchronizes through.
pub struct ProcessGroup {
    collective: Box<dyn Collective>,
    device: Device,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.collective.rank())
            .field("world_size", &self.collective.world_size())
            .field("device", &self.device)
            .finish()
    }
}

impl ProcessGroup {
    /// Bind this replica to its device. `device_list` gives one device index
    /// per replica; `rank` selects ours. A rendezvous URL is required as soon
    /// as the world is larger than one replica.
    pub fn init(
        device_list: &[usize],
        rank: usize,
        rendezvous_url: Option<&str>,
    ) -> Result<Self, TrainError> {
        if device_list.is_empty() {
            return Err(TrainError::config("device_list must not be empty"));
        }
        let world_size = device_list.len();
        if rank >= world_size {
            return Err(TrainError::config(format!(
                "rank {} out of range for {} devices",
                rank, world_size
            )));
        }
        if world_size > 1 {
            let url = rendezvous_url.unwrap_or("<none>");
            return Err(TrainError::collective(format!(
                "no collective transport available for {} replicas (rendezvous {})",
                world_size, url
            )));
        }

        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(device_list[rank])
                .map_err(|err| TrainError::runtime(err.to_string()))?
        } else {
            Device::Cpu
        };

        Ok(Self {
            collective: Box::new(LocalGroup),
            device,
        })
    }

    /// Assemble a group around an existing collective. Test seam.
    pub fn with_collective(collective: Box<dyn Collective>, device: Device) -> Self {
        Self { collective, device }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Rank 0 owns logging, checkpoint writes, and parameter export.
    pub fn is_coordinator(&self) -> bool {
        self.collective.rank() == 0
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn barrier(&self) -> Result<(), TrainError> {
        self.collective.barrier()
    }

    /// Overwrite every replica's parameters with the coordinator's so all
    /// replicas start from identical weights.
    pub fn broadcast_model(&self, model: &dyn SeqModel) -> Result<(), TrainError> {
        if self.collective.world_size() <= 1 {
            return Ok(());
        }
        for (_, var) in model.named_parameters() {
            let tensor = var.as_tensor();
            let dims = tensor.dims().to_vec();
            let mut values = tensor
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .flatten_all()
                .map_err(to_runtime_error)?
                .to_vec1::<f32>()
                .map_err(to_runtime_error)?;
            self.collective.broadcast(&mut values, 0)?;
            let numel = values.len();
            let replacement = Tensor::from_vec(values, numel, &self.device)
                .map_err(to_runtime_error)?
                .reshape(dims.as_slice())
                .map_err(to_runtime_error)?
                .to_dtype(tensor.dtype())
                .map_err(to_runtime_error)?;
            var.set(&replacement).map_err(to_runtime_error)?;
        }
        Ok(())
    }
}

/// A localhost rendezvous address with a currently-free port.
pub fn free_rendezvous_url() -> Result<String, TrainError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(format!("tcp://127.0.0.1:{}", port))
}

fn to_runtime_error(err: candle_core::Error) -> TrainError {
    TrainError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_replica_group_binds_rank_zero() {
        let group = ProcessGroup::init(&[0], 0, None).unwrap();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        assert!(group.is_coordinator());
    }

    #[test]
    fn empty_device_list_is_rejected() {
        let err = ProcessGroup::init(&[], 0, None).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let err = ProcessGroup::init(&[0], 1, None).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn multi_device_without_transport_fails() {
        let err = ProcessGroup::init(&[0, 1], 0, Some("tcp://127.0.0.1:9")).unwrap_err();
        assert!(matches!(err, TrainError::Collective(_)));
    }

    #[test]
    fn rendezvous_url_is_well_formed() {
        let url = free_rendezvous_url().unwrap();
        assert!(url.starts_with("tcp://127.0.0.1:"));
    }
}
