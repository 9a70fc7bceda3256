//! Error types for model assembly and execution.

use dlrm_embedding::EmbeddingError;
use dlrm_layers::LayerError;
use thiserror::Error;

/// Broad class of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected while building the model, before any batch is processed.
    Configuration,
    /// The batch handed to a forward call is malformed.
    InputCorruption,
    /// Ranks disagree about the table layout, or a peer failed.
    CollectiveProtocol,
}

/// Errors that can occur while building or running a model.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Interaction op other than `dot` or `cat`.
    #[error("unsupported interaction op: {op}")]
    UnsupportedInteraction {
        /// The rejected op.
        op: String,
    },

    /// Two sizes that must agree do not.
    #[error("dimension mismatch: {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which sizes were compared.
        what: String,
        /// Derived or required value.
        expected: usize,
        /// Declared or supplied value.
        actual: usize,
    },

    /// An architecture string is not a dash-separated list of integers.
    #[error("invalid architecture string {input:?}: {message}")]
    InvalidArchitecture {
        /// The string as given.
        input: String,
        /// What is wrong with it.
        message: String,
    },

    /// Low-bit embedding quantization combined with a table trick.
    #[error("{bits}-bit embedding quantization is incompatible with {trick} embeddings")]
    IncompatibleQuantization {
        /// Requested embedding bit width.
        bits: u32,
        /// The enabled trick.
        trick: &'static str,
    },

    /// Bit width outside the supported set.
    #[error("unsupported {target} bit width {bits}")]
    UnsupportedBitWidth {
        /// `embedding` or `mlp`.
        target: &'static str,
        /// The rejected width.
        bits: u32,
    },

    /// Any other invalid setting.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Batch size is not a multiple of the rank count.
    #[error("batch size {batch_size} is not divisible by {ranks} ranks")]
    BatchNotDivisible {
        /// Rows in the batch.
        batch_size: usize,
        /// Number of ranks.
        ranks: usize,
    },

    /// Batch has fewer rows than there are ranks.
    #[error("batch size {batch_size} is smaller than {ranks} ranks")]
    BatchSmallerThanRanks {
        /// Rows in the batch.
        batch_size: usize,
        /// Number of ranks.
        ranks: usize,
    },

    /// Dense and sparse inputs disagree, or the dense width is wrong.
    #[error("corrupted input: {message}")]
    CorruptedInput {
        /// Description of the problem.
        message: String,
    },

    /// A rank holds a different number of tables than its shard plan assigns.
    #[error("rank {rank} holds {actual} tables but its shard has {expected}")]
    ShardMismatch {
        /// The rank.
        rank: usize,
        /// Tables assigned by the shard plan.
        expected: usize,
        /// Tables actually present.
        actual: usize,
    },

    /// A collective call failed or was aborted by a peer.
    #[error("collective failure on rank {rank}: {message}")]
    Collective {
        /// The rank that observed the failure.
        rank: usize,
        /// Description of the failure.
        message: String,
    },

    /// Error from the dense layers.
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// Error from the embedding tables.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Config file could not be parsed.
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config file could not be read.
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BatchNotDivisible { .. }
            | Self::BatchSmallerThanRanks { .. }
            | Self::CorruptedInput { .. } => ErrorKind::InputCorruption,
            Self::ShardMismatch { .. } | Self::Collective { .. } => ErrorKind::CollectiveProtocol,
            Self::Embedding(e) => match e {
                EmbeddingError::IndexOutOfBounds { .. }
                | EmbeddingError::TableCountMismatch { .. }
                | EmbeddingError::InvalidOffsets { .. }
                | EmbeddingError::BatchSizeMismatch { .. } => ErrorKind::InputCorruption,
                _ => ErrorKind::Configuration,
            },
            Self::Layer(LayerError::InvalidInputDimension { .. }) => ErrorKind::InputCorruption,
            _ => ErrorKind::Configuration,
        }
    }
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
