//! Error types for embedding storage and lookup.

use dlrm_layers::LayerError;
use thiserror::Error;

/// Errors that can occur while building, quantizing or reading tables.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// A sparse index is not a row of its table.
    #[error("index {index} out of bounds for table {table} with {rows} rows")]
    IndexOutOfBounds {
        /// Global table index.
        table: usize,
        /// The offending row index.
        index: usize,
        /// Row count of the table.
        rows: usize,
    },

    /// A direct row read past the end of a table.
    #[error("row {index} out of bounds ({rows} rows)")]
    RowOutOfBounds {
        /// The requested row.
        index: usize,
        /// Row count of the table.
        rows: usize,
    },

    /// Index lists, offset lists and tables disagree on the table count.
    #[error("table count mismatch: {tables} tables, {indices} index lists, {offsets} offset lists")]
    TableCountMismatch {
        /// Number of tables in the store.
        tables: usize,
        /// Number of index lists supplied.
        indices: usize,
        /// Number of offset lists supplied.
        offsets: usize,
    },

    /// An offset list is decreasing or points past its index list.
    #[error("invalid offsets for table {table}: {message}")]
    InvalidOffsets {
        /// Table whose offsets are malformed.
        table: usize,
        /// What is wrong with them.
        message: String,
    },

    /// Offset lists of different tables describe different batch sizes.
    #[error("batch size mismatch at table {table}: expected {expected}, got {actual}")]
    BatchSizeMismatch {
        /// Table whose batch size differs.
        table: usize,
        /// Batch size of table 0.
        expected: usize,
        /// Batch size of this table.
        actual: usize,
    },

    /// Quantization requested with a bit width other than 4 or 8.
    #[error("unsupported embedding bit width {bits}: expected 4 or 8")]
    UnsupportedBitWidth {
        /// The rejected width.
        bits: u32,
    },

    /// Low-bit quantization requested for a table using a sharing trick.
    #[error("{bits}-bit quantization is not supported with {trick} tables")]
    IncompatibleTrick {
        /// The requested width.
        bits: u32,
        /// Name of the trick (`quotient-remainder` or `mixed-dimension`).
        trick: &'static str,
    },

    /// A weight buffer or vector has the wrong length.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A row holds values that cannot be quantized.
    #[error("row {row} contains values outside the quantizable range")]
    NonFinite {
        /// The offending row.
        row: usize,
    },

    /// Invalid table or trick configuration.
    #[error("embedding configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Error from the mixed-dimension projection.
    #[error(transparent)]
    Layer(#[from] LayerError),
}

/// A specialized Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;
