//! Model and execution configuration.
//!
//! A [`ModelConfig`] fixes every shape in the model. It can be written by
//! hand, loaded from JSON or assembled from dash-separated architecture
//! strings, and [`ModelConfig::validate`] rejects every inconsistent
//! combination before any weights are allocated.
//!
//! # Example
//!
//! ```
//! use dlrm_engine::config::{parse_dash_separated, ModelConfig};
//!
//! let config = ModelConfig::new(
//!     4,
//!     parse_dash_separated("5-5").unwrap(),
//!     parse_dash_separated("4-8-4").unwrap(),
//!     vec![7, 8, 1],
//! );
//! assert_eq!(config.validate().unwrap(), 7);
//! ```

use std::path::Path;

use dlrm_embedding::{md_solver, QrOperation};
use dlrm_layers::{interaction_width, EncoderConfig, InteractionOp};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default master seed.
pub const DEFAULT_SEED: u64 = 123;

/// Quotient-remainder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrConfig {
    /// Rows of the remainder table.
    pub collisions: usize,
    /// How quotient and remainder vectors are combined.
    #[serde(default)]
    pub operation: QrOperation,
    /// Tables with more rows than this use the trick.
    #[serde(default = "default_trick_threshold")]
    pub threshold: usize,
}

/// Mixed-dimension settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdConfig {
    /// Tables with more rows than this get a solved width.
    #[serde(default = "default_trick_threshold")]
    pub threshold: usize,
    /// Exponent of the power rule.
    #[serde(default = "default_md_temperature")]
    pub temperature: f32,
    /// Round solved widths to powers of two.
    #[serde(default)]
    pub round_dims: bool,
}

fn default_trick_threshold() -> usize {
    200
}

fn default_md_temperature() -> f32 {
    0.3
}

fn default_bits() -> u32 {
    32
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

/// Shape of one table as resolved from the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TableSpec {
    /// A single `rows x dim` table.
    Plain {
        /// Row count.
        rows: usize,
        /// Width.
        dim: usize,
    },
    /// Quotient and remainder tables of width `dim`.
    QuotientRemainder {
        /// Logical row count.
        rows: usize,
        /// Width of both tables.
        dim: usize,
        /// Remainder rows.
        collisions: usize,
        /// Combination operator.
        operation: QrOperation,
    },
    /// A `rows x dim` table projected to `base_dim`.
    MixedDim {
        /// Row count.
        rows: usize,
        /// Stored width.
        dim: usize,
        /// Shared output width.
        base_dim: usize,
    },
}

impl TableSpec {
    /// Width of the pooled vector.
    pub fn output_width(&self) -> usize {
        match *self {
            Self::Plain { dim, .. } => dim,
            Self::QuotientRemainder {
                dim, operation, ..
            } => match operation {
                QrOperation::Concat => 2 * dim,
                _ => dim,
            },
            Self::MixedDim { base_dim, .. } => base_dim,
        }
    }
}

/// Every shape-determining parameter of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding width.
    pub sparse_feature_size: usize,
    /// Row count of every table.
    pub embedding_rows: Vec<usize>,
    /// Bottom encoder widths, starting with the dense feature count.
    pub bottom_mlp: Vec<usize>,
    /// Top encoder widths, starting with the interaction width.
    pub top_mlp: Vec<usize>,
    /// Interaction operator.
    #[serde(default)]
    pub interaction_op: InteractionOp,
    /// Keep the Gram diagonal in the dot interaction.
    #[serde(default)]
    pub self_interaction: bool,
    /// Width of the projected dot variant, 0 to disable.
    #[serde(default)]
    pub projection_size: usize,
    /// Scores are clamped into `(t, 1 - t)` when `0 < t < 1`.
    #[serde(default)]
    pub loss_threshold: f32,
    /// Embedding storage width: 4, 8 or 32.
    #[serde(default = "default_bits")]
    pub embedding_bits: u32,
    /// Encoder weight width: 8, 16 or 32.
    #[serde(default = "default_bits")]
    pub mlp_bits: u32,
    /// Quotient-remainder trick.
    #[serde(default)]
    pub qr: Option<QrConfig>,
    /// Mixed-dimension trick.
    #[serde(default)]
    pub md: Option<MdConfig>,
    /// Master seed for all weights.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Layer of the bottom encoder ending in a sigmoid.
    #[serde(default)]
    pub sigmoid_bottom: Option<usize>,
    /// Layer of the top encoder ending in a sigmoid; the last one if unset.
    #[serde(default)]
    pub sigmoid_top: Option<usize>,
}

impl ModelConfig {
    /// Creates a dot-interaction configuration with default knobs.
    pub fn new(
        sparse_feature_size: usize,
        embedding_rows: Vec<usize>,
        bottom_mlp: Vec<usize>,
        top_mlp: Vec<usize>,
    ) -> Self {
        Self {
            sparse_feature_size,
            embedding_rows,
            bottom_mlp,
            top_mlp,
            interaction_op: InteractionOp::Dot,
            self_interaction: false,
            projection_size: 0,
            loss_threshold: 0.0,
            embedding_bits: 32,
            mlp_bits: 32,
            qr: None,
            md: None,
            seed: DEFAULT_SEED,
            sigmoid_bottom: None,
            sigmoid_top: None,
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Number of tables.
    pub fn num_tables(&self) -> usize {
        self.embedding_rows.len()
    }

    /// Dense feature count.
    pub fn dense_features(&self) -> usize {
        self.bottom_mlp.first().copied().unwrap_or(0)
    }

    /// Width of the bottom encoder output.
    pub fn bottom_output(&self) -> usize {
        self.bottom_mlp.last().copied().unwrap_or(0)
    }

    /// Interaction width derived from the table count and bottom output.
    pub fn num_interactions(&self) -> usize {
        interaction_width(
            self.interaction_op,
            self.num_tables() + 1,
            self.bottom_output(),
            self.self_interaction,
            self.projection_size,
        )
    }

    /// Bottom encoder layout.
    pub fn bottom_config(&self) -> EncoderConfig {
        let config = EncoderConfig::new(self.bottom_mlp.clone());
        match self.sigmoid_bottom {
            Some(i) => config.with_sigmoid_layer(i),
            None => config,
        }
    }

    /// Top encoder layout.
    pub fn top_config(&self) -> EncoderConfig {
        let config = EncoderConfig::new(self.top_mlp.clone());
        match self.sigmoid_top {
            Some(i) => config.with_sigmoid_layer(i),
            None => config.with_sigmoid_last(),
        }
    }

    /// Resolves the shape of every table.
    pub fn table_specs(&self) -> Vec<TableSpec> {
        let m = self.sparse_feature_size;
        if let Some(qr) = &self.qr {
            return self
                .embedding_rows
                .iter()
                .map(|&rows| {
                    if rows > qr.threshold {
                        TableSpec::QuotientRemainder {
                            rows,
                            dim: m,
                            collisions: qr.collisions,
                            operation: qr.operation,
                        }
                    } else {
                        TableSpec::Plain { rows, dim: m }
                    }
                })
                .collect();
        }
        if let Some(md) = &self.md {
            let dims = md_solver(&self.embedding_rows, m, md.temperature, md.round_dims);
            let base_dim = dims.iter().copied().max().unwrap_or(m);
            return self
                .embedding_rows
                .iter()
                .zip(dims)
                .map(|(&rows, dim)| {
                    let dim = if rows > md.threshold { dim } else { base_dim };
                    TableSpec::MixedDim {
                        rows,
                        dim,
                        base_dim,
                    }
                })
                .collect();
        }
        self.embedding_rows
            .iter()
            .map(|&rows| TableSpec::Plain { rows, dim: m })
            .collect()
    }

    /// Checks every build-time constraint and returns the interaction width.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnsupportedBitWidth`] for embedding bits outside
    ///   `{4, 8, 32}` or encoder bits outside `{8, 16, 32}`
    /// - [`EngineError::IncompatibleQuantization`] for 4/8-bit embeddings
    ///   combined with a table trick
    /// - [`EngineError::DimensionMismatch`] when a pooled width differs from
    ///   the bottom output or the declared top input differs from the
    ///   derived interaction width
    /// - [`EngineError::InvalidConfig`] for any other inconsistency
    pub fn validate(&self) -> Result<usize> {
        if !matches!(self.embedding_bits, 4 | 8 | 32) {
            return Err(EngineError::UnsupportedBitWidth {
                target: "embedding",
                bits: self.embedding_bits,
            });
        }
        if !matches!(self.mlp_bits, 8 | 16 | 32) {
            return Err(EngineError::UnsupportedBitWidth {
                target: "mlp",
                bits: self.mlp_bits,
            });
        }
        if self.qr.is_some() && self.md.is_some() {
            return Err(EngineError::InvalidConfig {
                message: "quotient-remainder and mixed-dimension cannot both be enabled".into(),
            });
        }
        if self.embedding_bits != 32 {
            if self.qr.is_some() {
                return Err(EngineError::IncompatibleQuantization {
                    bits: self.embedding_bits,
                    trick: "quotient-remainder",
                });
            }
            if self.md.is_some() {
                return Err(EngineError::IncompatibleQuantization {
                    bits: self.embedding_bits,
                    trick: "mixed-dimension",
                });
            }
        }
        if let Some(qr) = &self.qr {
            if qr.collisions == 0 {
                return Err(EngineError::InvalidConfig {
                    message: "quotient-remainder collisions must be positive".into(),
                });
            }
        }
        if let Some(md) = &self.md {
            if md.temperature.is_nan() || md.temperature < 0.0 {
                return Err(EngineError::InvalidConfig {
                    message: format!("mixed-dimension temperature {} is negative", md.temperature),
                });
            }
        }
        if self.sparse_feature_size == 0 {
            return Err(EngineError::InvalidConfig {
                message: "sparse feature size must be positive".into(),
            });
        }
        self.bottom_config().validate()?;
        self.top_config().validate()?;
        if !(0.0..1.0).contains(&self.loss_threshold) {
            return Err(EngineError::InvalidConfig {
                message: format!("loss threshold {} outside [0, 1)", self.loss_threshold),
            });
        }
        if self.projection_size > 0 && self.interaction_op != InteractionOp::Dot {
            return Err(EngineError::InvalidConfig {
                message: format!(
                    "interaction projection requires the dot op, got {}",
                    self.interaction_op
                ),
            });
        }

        let bottom_out = self.bottom_output();
        for (t, spec) in self.table_specs().iter().enumerate() {
            if spec.output_width() != bottom_out {
                return Err(EngineError::DimensionMismatch {
                    what: format!("pooled width of table {t} vs bottom output"),
                    expected: bottom_out,
                    actual: spec.output_width(),
                });
            }
        }

        let num_int = self.num_interactions();
        if self.top_mlp[0] != num_int {
            return Err(EngineError::DimensionMismatch {
                what: "top encoder input vs interaction width".into(),
                expected: num_int,
                actual: self.top_mlp[0],
            });
        }
        Ok(num_int)
    }
}

/// Device and rank layout of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Devices in this process.
    #[serde(default = "default_one")]
    pub devices: usize,
    /// Processes in the collective group; 0 and 1 both mean none.
    #[serde(default = "default_one")]
    pub ranks: usize,
    /// Re-replicate dense encoders on every call.
    #[serde(default)]
    pub sync_dense_params: bool,
}

fn default_one() -> usize {
    1
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            ranks: 1,
            sync_dense_params: false,
        }
    }
}

impl ExecutionConfig {
    /// Single device, single process.
    pub fn sequential() -> Self {
        Self::default()
    }

    /// One process driving `devices` devices.
    pub fn devices(devices: usize) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    /// `ranks` processes.
    pub fn ranks(ranks: usize) -> Self {
        Self {
            ranks,
            ..Self::default()
        }
    }

    /// Returns true if more than one rank takes part.
    pub fn is_distributed(&self) -> bool {
        self.ranks > 1
    }

    /// Checks the layout.
    pub fn validate(&self) -> Result<()> {
        if self.devices == 0 {
            return Err(EngineError::InvalidConfig {
                message: "device count must be positive".into(),
            });
        }
        if self.devices > 1 && self.ranks > 1 {
            return Err(EngineError::InvalidConfig {
                message: format!(
                    "{} devices per process cannot be combined with {} ranks",
                    self.devices, self.ranks
                ),
            });
        }
        Ok(())
    }
}

/// Parses `"13-512-256"` into `[13, 512, 256]`.
///
/// ```
/// use dlrm_engine::config::parse_dash_separated;
///
/// assert_eq!(parse_dash_separated("4-3-2").unwrap(), vec![4, 3, 2]);
/// assert!(parse_dash_separated("4--2").is_err());
/// ```
pub fn parse_dash_separated(input: &str) -> Result<Vec<usize>> {
    input
        .trim()
        .split('-')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|e| EngineError::InvalidArchitecture {
                    input: input.to_string(),
                    message: format!("{part:?}: {e}"),
                })
        })
        .collect()
}
