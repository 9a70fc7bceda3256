//! DLRM CLI Library
//!
//! Command-line driver for the inference engine:
//!
//! - **Bench**: score synthetic batches under a chosen execution strategy
//! - **Describe**: print the shape contract of a model as JSON
//!
//! # Example
//!
//! ```bash
//! # Four tables, two ranks, 100 batches of 128 rows
//! dlrm bench --arch-embedding-size 1000-1000-500-200 --arch-sparse-feature-size 16 \
//!     --arch-mlp-bot 13-64-16 --arch-mlp-top 32-1 --ranks 2 \
//!     --mini-batch-size 128 --num-batches 100
//!
//! # Shape contract of a model described in JSON
//! dlrm describe --config model.json
//! ```

pub mod commands;
pub mod synthetic;

use clap::{Parser, Subcommand};

pub use commands::{BenchCommand, BenchReport, DescribeCommand, ModelArgs};
pub use synthetic::SyntheticBatches;

/// DLRM - click-probability inference with sharded embedding tables
#[derive(Parser, Debug)]
#[command(name = "dlrm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score synthetic batches and report throughput
    Bench(BenchCommand),

    /// Print the model's shape contract as JSON
    Describe(DescribeCommand),
}

/// Result type alias for CLI operations
pub type CliResult<T> = anyhow::Result<T>;
