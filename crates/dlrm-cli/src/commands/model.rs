//! Model flags shared by every command.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use dlrm_embedding::QrOperation;
use dlrm_engine::{parse_dash_separated, MdConfig, ModelConfig, QrConfig};
use dlrm_layers::InteractionOp;
use tracing::info;

/// Model architecture, from a JSON file or from `--arch-*` flags.
///
/// The top encoder flag leaves out its input width; it is derived from
/// the table count, the interaction op and the bottom output, and
/// prepended.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Model configuration file (JSON). Overrides every `--arch-*` flag.
    #[arg(long, short = 'c', env = "DLRM_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Width of every embedding vector
    #[arg(long, default_value = "2")]
    pub arch_sparse_feature_size: usize,

    /// Rows of each table, dash separated
    #[arg(long, default_value = "4-3-2")]
    pub arch_embedding_size: String,

    /// Bottom encoder widths including the dense feature count
    #[arg(long, default_value = "4-3-2")]
    pub arch_mlp_bot: String,

    /// Top encoder widths after the interaction
    #[arg(long, default_value = "4-2-1")]
    pub arch_mlp_top: String,

    /// Interaction op: `dot` or `cat`
    #[arg(long, default_value = "dot")]
    pub arch_interaction_op: String,

    /// Include self pairs in dot interactions
    #[arg(long)]
    pub arch_interaction_itself: bool,

    /// Width of the interaction projection (0 disables it)
    #[arg(long, default_value = "0")]
    pub arch_projection_size: usize,

    /// Clamp scores into `(t, 1 - t)`; 0 disables clamping
    #[arg(long, default_value = "0.0")]
    pub loss_threshold: f32,

    /// Embedding table bit width: 4, 8 or 32
    #[arg(long, default_value = "32")]
    pub quantize_emb_bit_width: u32,

    /// Dense encoder bit width: 8, 16 or 32
    #[arg(long, default_value = "32")]
    pub quantize_mlp_bit_width: u32,

    /// Use quotient-remainder tables for large features
    #[arg(long)]
    pub qr_flag: bool,

    /// Quotient-remainder combine op: `mult`, `add` or `concat`
    #[arg(long, default_value = "mult")]
    pub qr_operation: String,

    /// Rows of the remainder table
    #[arg(long, default_value = "4")]
    pub qr_collisions: usize,

    /// Tables with more rows than this use quotient-remainder
    #[arg(long, default_value = "200")]
    pub qr_threshold: usize,

    /// Use mixed-dimension tables
    #[arg(long)]
    pub md_flag: bool,

    /// Tables with more rows than this get a solved width
    #[arg(long, default_value = "200")]
    pub md_threshold: usize,

    /// Exponent of the mixed-dimension power rule
    #[arg(long, default_value = "0.3")]
    pub md_temperature: f32,

    /// Round mixed-dimension widths to powers of two
    #[arg(long)]
    pub md_round_dims: bool,

    /// Master seed for weight initialization
    #[arg(long, env = "DLRM_SEED", default_value = "123")]
    pub seed: u64,
}

impl ModelArgs {
    /// Resolves the configuration and validates it.
    pub fn to_config(&self) -> Result<ModelConfig> {
        let config = match &self.config {
            Some(path) => {
                info!("Loading model config from: {:?}", path);
                ModelConfig::from_json_file(path)
                    .with_context(|| format!("Failed to load model config {}", path.display()))?
            }
            None => self.flags_config()?,
        };
        let num_int = config.validate().context("Invalid model configuration")?;
        info!(
            tables = config.num_tables(),
            dense_features = config.dense_features(),
            num_int,
            "Resolved model configuration"
        );
        Ok(config)
    }

    fn flags_config(&self) -> Result<ModelConfig> {
        let rows =
            parse_dash_separated(&self.arch_embedding_size).context("Invalid --arch-embedding-size")?;
        let bottom = parse_dash_separated(&self.arch_mlp_bot).context("Invalid --arch-mlp-bot")?;
        let top_tail = parse_dash_separated(&self.arch_mlp_top).context("Invalid --arch-mlp-top")?;
        if self.qr_flag && self.md_flag {
            bail!("--qr-flag and --md-flag cannot be combined");
        }

        let mut config = ModelConfig::new(self.arch_sparse_feature_size, rows, bottom, Vec::new());
        config.interaction_op = self
            .arch_interaction_op
            .parse::<InteractionOp>()
            .context("Invalid --arch-interaction-op")?;
        config.self_interaction = self.arch_interaction_itself;
        config.projection_size = self.arch_projection_size;
        config.loss_threshold = self.loss_threshold;
        config.embedding_bits = self.quantize_emb_bit_width;
        config.mlp_bits = self.quantize_mlp_bit_width;
        config.seed = self.seed;
        if self.qr_flag {
            config.qr = Some(QrConfig {
                collisions: self.qr_collisions,
                operation: self
                    .qr_operation
                    .parse::<QrOperation>()
                    .context("Invalid --qr-operation")?,
                threshold: self.qr_threshold,
            });
        }
        if self.md_flag {
            config.md = Some(MdConfig {
                threshold: self.md_threshold,
                temperature: self.md_temperature,
                round_dims: self.md_round_dims,
            });
        }

        config.top_mlp = std::iter::once(config.num_interactions())
            .chain(top_tail)
            .collect();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cli;
    use crate::Commands;
    use clap::Parser;

    fn describe_args(extra: &[&str]) -> ModelArgs {
        let mut argv = vec!["dlrm", "describe"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Describe(cmd) => cmd.model,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_defaults_prepend_top_input() {
        let config = describe_args(&[]).to_config().unwrap();
        assert_eq!(config.embedding_rows, vec![4, 3, 2]);
        assert_eq!(config.bottom_mlp, vec![4, 3, 2]);
        // Four features, dot without self pairs: 2 + 6.
        assert_eq!(config.top_mlp, vec![8, 4, 2, 1]);
        assert_eq!(config.seed, 123);
    }

    #[test]
    fn test_cat_and_projection_widths() {
        let cat = describe_args(&["--arch-interaction-op", "cat"]).to_config().unwrap();
        assert_eq!(cat.top_mlp[0], 8);

        let proj = describe_args(&["--arch-projection-size", "3"]).to_config().unwrap();
        assert_eq!(proj.top_mlp[0], 2 + 4 * 3);
    }

    #[test]
    fn test_rejects_bad_flags() {
        assert!(describe_args(&["--arch-interaction-op", "sum"]).to_config().is_err());
        assert!(describe_args(&["--arch-mlp-bot", "4-x-2"]).to_config().is_err());
        assert!(describe_args(&["--quantize-emb-bit-width", "2"]).to_config().is_err());
        assert!(describe_args(&["--qr-flag", "--md-flag"]).to_config().is_err());
        assert!(describe_args(&["--qr-flag", "--quantize-emb-bit-width", "8"])
            .to_config()
            .is_err());
    }
}
