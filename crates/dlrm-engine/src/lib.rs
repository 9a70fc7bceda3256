//! DLRM model assembly and parallel execution.
//!
//! This crate ties the dense layers and the embedding tables into a
//! click-probability model and runs it under one of three strategies.
//!
//! # Overview
//!
//! - [`ModelConfig`] / [`ExecutionConfig`] - shapes, quantization and
//!   device/rank layout, validated before anything is allocated
//! - [`DlrmModel`] - the built model (or one rank's shard of it) with a
//!   single-device forward pass
//! - [`ShardPlan`] / [`DeviceAssignment`] - how tables and rows are split
//! - [`Collective`] / [`LocalCollectiveGroup`] - all-to-all, all-gather and
//!   barrier between ranks
//! - [`ExecutionStrategy`] - sequential, device-parallel or distributed
//!   execution, chosen once
//!
//! # Example
//!
//! ```
//! use dlrm_embedding::SparseBatch;
//! use dlrm_engine::{DlrmModel, ExecutionConfig, ExecutionStrategy, ModelConfig};
//! use dlrm_layers::Tensor;
//!
//! let config = ModelConfig::new(4, vec![5, 5], vec![4, 4], vec![7, 1]);
//! let model = DlrmModel::build(config).unwrap();
//! let mut strategy = ExecutionStrategy::new(model, &ExecutionConfig::devices(2)).unwrap();
//!
//! let dense = Tensor::ones(&[2, 4]);
//! let sparse = SparseBatch::fixed(vec![vec![0, 1, 2, 3], vec![4, 3, 2, 1]], 2).unwrap();
//! let scores = strategy.forward(&dense, &sparse).unwrap();
//! assert_eq!(scores.shape(), &[2, 1]);
//! ```

#![warn(missing_docs)]

pub mod collective;
pub mod config;
pub mod error;
pub mod model;
pub mod shard;
pub mod strategy;

pub use collective::{AllToAllPlan, Collective, LocalCollective, LocalCollectiveGroup};
pub use config::{parse_dash_separated, ExecutionConfig, MdConfig, ModelConfig, QrConfig};
pub use error::{EngineError, ErrorKind, Result};
pub use model::{DenseModel, DlrmModel, ShapeContract};
pub use shard::{DeviceAssignment, ShardPlan};
pub use strategy::{
    launch_local, DeviceParallelStrategy, DistributedStrategy, ExecutionStrategy,
    SequentialStrategy,
};
