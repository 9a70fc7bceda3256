//! Bench Command Implementation
//!
//! Scores seeded synthetic batches under the selected execution strategy
//! and reports throughput.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Args;
use dlrm_embedding::{SparseBatch, UniformTableInit};
use dlrm_engine::{launch_local, DlrmModel, ExecutionConfig, ExecutionStrategy, ModelConfig};
use dlrm_layers::{Tensor, VarianceScaledNormal};
use tracing::info;

use super::ModelArgs;
use crate::synthetic::SyntheticBatches;

/// Score synthetic batches and report batches per second
///
/// # Example
///
/// ```bash
/// dlrm bench --arch-embedding-size 100-100-100 --arch-mlp-bot 4-8-2 \
///     --devices 2 --mini-batch-size 64 --num-batches 50
/// ```
#[derive(Args, Debug, Clone)]
pub struct BenchCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Rows per batch
    #[arg(long, short = 'b', default_value = "1")]
    pub mini_batch_size: usize,

    /// Number of batches to score
    #[arg(long, short = 'n', default_value = "10")]
    pub num_batches: usize,

    /// Upper bound on indices per lookup segment
    #[arg(long, default_value = "10")]
    pub num_indices_per_lookup: usize,

    /// Use exactly `--num-indices-per-lookup` indices in every segment
    #[arg(long)]
    pub num_indices_per_lookup_fixed: bool,

    /// Seed of the synthetic data generator
    #[arg(long, default_value = "0")]
    pub data_seed: u64,

    /// Devices in this process
    #[arg(long, env = "DLRM_DEVICES", default_value = "1")]
    pub devices: usize,

    /// Ranks in the collective group, run as threads of this process
    #[arg(long, env = "DLRM_RANKS", default_value = "1")]
    pub ranks: usize,

    /// Re-replicate dense encoders on every call
    #[arg(long)]
    pub sync_dense_params: bool,

    /// Print the scores of the last batch as JSON
    #[arg(long)]
    pub print_scores: bool,
}

/// Outcome of a benchmark run.
#[derive(Debug, Clone)]
pub struct BenchReport {
    /// Strategy that scored the batches.
    pub strategy: &'static str,
    /// Batches scored.
    pub batches: usize,
    /// Wall time spent in forward calls.
    pub elapsed: Duration,
    /// Scores of the last batch.
    pub last_scores: Option<Tensor>,
}

impl BenchReport {
    /// Elapsed wall time in whole milliseconds, saturating at `u64::MAX`.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    /// Throughput over the timed calls.
    pub fn batches_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.batches as f64 / secs
        } else {
            0.0
        }
    }
}

impl BenchCommand {
    /// Execute the bench command
    pub async fn run(&self) -> Result<()> {
        let report = self.execute().await?;
        info!(
            strategy = report.strategy,
            batches = report.batches,
            batch_size = self.mini_batch_size,
            elapsed_ms = report.elapsed_ms(),
            batches_per_sec = report.batches_per_sec(),
            "Benchmark finished"
        );
        if self.print_scores {
            if let Some(scores) = &report.last_scores {
                println!("{}", serde_json::to_string(scores.data())?);
            }
        }
        Ok(())
    }

    /// Builds the model, scores every batch and returns the timings.
    pub async fn execute(&self) -> Result<BenchReport> {
        if self.mini_batch_size == 0 {
            bail!("--mini-batch-size must be positive");
        }
        let config = self.model.to_config()?;
        let exec = ExecutionConfig {
            devices: self.devices,
            ranks: self.ranks,
            sync_dense_params: self.sync_dense_params,
        };
        exec.validate().context("Invalid execution layout")?;

        let batches = SyntheticBatches::new(
            &config,
            self.mini_batch_size,
            self.num_indices_per_lookup,
            self.num_indices_per_lookup_fixed,
            self.data_seed,
        )
        .take_batches(self.num_batches)?;
        info!(
            batches = batches.len(),
            batch_size = self.mini_batch_size,
            devices = exec.devices,
            ranks = exec.ranks,
            "Generated synthetic batches"
        );

        let report = tokio::task::spawn_blocking(move || {
            if exec.is_distributed() {
                run_distributed(&config, exec.ranks, &batches)
            } else {
                run_local(config, &exec, &batches)
            }
        })
        .await
        .context("Benchmark task failed")??;
        Ok(report)
    }
}

fn run_local(
    config: ModelConfig,
    exec: &ExecutionConfig,
    batches: &[(Tensor, SparseBatch)],
) -> Result<BenchReport> {
    let model = DlrmModel::build(config).context("Failed to build model")?;
    let mut strategy = ExecutionStrategy::new(model, exec)?;
    let start = Instant::now();
    let mut last_scores = None;
    for (dense, sparse) in batches {
        last_scores = Some(strategy.forward(dense, sparse)?);
    }
    Ok(BenchReport {
        strategy: strategy.name(),
        batches: batches.len(),
        elapsed: start.elapsed(),
        last_scores,
    })
}

fn run_distributed(
    config: &ModelConfig,
    ranks: usize,
    batches: &[(Tensor, SparseBatch)],
) -> Result<BenchReport> {
    let per_rank = launch_local(
        config,
        ranks,
        &UniformTableInit,
        &VarianceScaledNormal,
        |strategy| {
            let start = Instant::now();
            let mut last = None;
            for (dense, sparse) in batches {
                last = Some(strategy.forward(dense, sparse)?);
            }
            Ok((start.elapsed(), last))
        },
    )?;
    // Every rank returns the full scores; rank 0 reports them.
    let elapsed = per_rank
        .iter()
        .map(|(elapsed, _)| *elapsed)
        .max()
        .unwrap_or_default();
    let last_scores = per_rank.into_iter().next().and_then(|(_, scores)| scores);
    Ok(BenchReport {
        strategy: "distributed",
        batches: batches.len(),
        elapsed,
        last_scores,
    })
}
