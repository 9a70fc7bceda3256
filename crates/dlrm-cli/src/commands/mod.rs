//! CLI Command Implementations
//!
//! - [`bench`]: synthetic inference benchmark
//! - [`describe`]: shape contract dump
//! - [`model`]: model flags shared by both

mod bench;
mod describe;
mod model;

pub use bench::{BenchCommand, BenchReport};
pub use describe::DescribeCommand;
pub use model::ModelArgs;
