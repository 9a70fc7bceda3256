//! Describe Command Implementation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use dlrm_embedding::UniformTableInit;
use dlrm_engine::{DlrmModel, ShapeContract};
use dlrm_layers::VarianceScaledNormal;
use tracing::info;

use super::ModelArgs;

/// Build a model and print its shape contract as JSON
///
/// With `--rank`/`--ranks` the contract of that rank's shard is printed
/// instead of the full model.
#[derive(Args, Debug, Clone)]
pub struct DescribeCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Describe the shard of this rank
    #[arg(long, requires = "ranks")]
    pub rank: Option<usize>,

    /// Ranks the tables are split over
    #[arg(long)]
    pub ranks: Option<usize>,

    /// Write the JSON here instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

impl DescribeCommand {
    /// Execute the describe command
    pub async fn run(&self) -> Result<()> {
        let contract = self.contract()?;
        let json = serde_json::to_string_pretty(&contract)?;
        match &self.output {
            Some(path) => {
                std::fs::write(path, json).context("Failed to write shape contract")?;
                info!("Wrote shape contract to {:?}", path);
            }
            None => println!("{json}"),
        }
        Ok(())
    }

    /// Builds the model or shard and returns its contract.
    pub fn contract(&self) -> Result<ShapeContract> {
        let config = self.model.to_config()?;
        let model = match self.ranks {
            Some(ranks) => DlrmModel::build_shard(
                config,
                self.rank.unwrap_or(0),
                ranks,
                &UniformTableInit,
                &VarianceScaledNormal,
            )
            .context("Failed to build model shard")?,
            None => DlrmModel::build(config).context("Failed to build model")?,
        };
        Ok(model.shape_contract())
    }
}
