//! Execution strategies.
//!
//! All strategies compute the same scores; they differ in where tables and
//! encoder copies live and how intermediate results move:
//!
//! - [`SequentialStrategy`]: everything on one device.
//! - [`DeviceParallelStrategy`]: encoders replicated per device, tables
//!   spread round-robin, pooled vectors shuffled between devices in memory.
//! - [`DistributedStrategy`]: one rank per process, each owning a row slice
//!   of the batch and a contiguous table slice, exchanging pooled vectors
//!   through a [`Collective`](crate::collective::Collective).
//!
//! The strategy is chosen once, when [`ExecutionStrategy`] is created.

mod device_parallel;
mod distributed;
mod sequential;

pub use device_parallel::DeviceParallelStrategy;
pub use distributed::{launch_local, DistributedStrategy};
pub use sequential::SequentialStrategy;

use dlrm_embedding::SparseBatch;
use dlrm_layers::Tensor;
use tracing::info;

use crate::collective::Collective;
use crate::config::ExecutionConfig;
use crate::error::{EngineError, Result};
use crate::model::DlrmModel;

/// The strategy driving a model's forward calls.
#[derive(Debug)]
pub enum ExecutionStrategy {
    /// Single device.
    Sequential(SequentialStrategy),
    /// Several devices in one process.
    DeviceParallel(DeviceParallelStrategy),
    /// One rank of a collective group.
    Distributed(DistributedStrategy),
}

impl ExecutionStrategy {
    /// Chooses the single-process strategy for `exec`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for an invalid layout or when
    /// `exec` asks for several ranks; use [`ExecutionStrategy::distributed`]
    /// or [`launch_local`] for those.
    pub fn new(model: DlrmModel, exec: &ExecutionConfig) -> Result<Self> {
        exec.validate()?;
        if exec.is_distributed() {
            return Err(EngineError::InvalidConfig {
                message: format!(
                    "{} ranks need a collective group; build each rank with a distributed strategy",
                    exec.ranks
                ),
            });
        }
        let strategy = if exec.devices > 1 {
            Self::DeviceParallel(DeviceParallelStrategy::new(
                model,
                exec.devices,
                exec.sync_dense_params,
            ))
        } else {
            Self::Sequential(SequentialStrategy::new(model))
        };
        info!(strategy = strategy.name(), devices = exec.devices, "Selected execution strategy");
        Ok(strategy)
    }

    /// Wraps one rank's shard and its collective handle.
    pub fn distributed(model: DlrmModel, collective: Box<dyn Collective>) -> Result<Self> {
        let strategy = Self::Distributed(DistributedStrategy::new(model, collective)?);
        info!(strategy = strategy.name(), "Selected execution strategy");
        Ok(strategy)
    }

    /// Scores one batch, returning a `[batch, 1]` tensor in input row order.
    pub fn forward(&mut self, dense: &Tensor, batch: &SparseBatch) -> Result<Tensor> {
        match self {
            Self::Sequential(s) => s.forward(dense, batch),
            Self::DeviceParallel(s) => s.forward(dense, batch),
            Self::Distributed(s) => s.forward(dense, batch),
        }
    }

    /// Short name of the strategy.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential(_) => "sequential",
            Self::DeviceParallel(_) => "device-parallel",
            Self::Distributed(_) => "distributed",
        }
    }

    /// The model, or this rank's shard of it.
    pub fn model(&self) -> &DlrmModel {
        match self {
            Self::Sequential(s) => s.model(),
            Self::DeviceParallel(s) => s.model(),
            Self::Distributed(s) => s.model(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model() -> DlrmModel {
        DlrmModel::build(ModelConfig::new(4, vec![5, 5], vec![4, 4], vec![7, 1])).unwrap()
    }

    #[test]
    fn test_selection() {
        let s = ExecutionStrategy::new(model(), &ExecutionConfig::sequential()).unwrap();
        assert_eq!(s.name(), "sequential");
        let s = ExecutionStrategy::new(model(), &ExecutionConfig::devices(3)).unwrap();
        assert_eq!(s.name(), "device-parallel");
        assert!(ExecutionStrategy::new(model(), &ExecutionConfig::ranks(2)).is_err());
    }
}
