//! Errors raised while building or running the dense layers.

use thiserror::Error;

/// Error type for tensor, MLP and interaction operations.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A tensor did not have the shape the operation needs.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Required shape
        expected: Vec<usize>,
        /// Shape received
        actual: Vec<usize>,
    },

    /// Input width differs from a dense layer's `in_features`.
    #[error("Invalid input dimension: expected {expected}, got {actual}")]
    InvalidInputDimension {
        /// `in_features`
        expected: usize,
        /// Width received
        actual: usize,
    },

    /// MLP widths that do not chain, or a projection on a non-dot op.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// What was wrong
        message: String,
    },

    /// The interaction operator name is not one of `dot` or `cat`.
    #[error("Unsupported interaction op: {op}")]
    UnsupportedInteraction {
        /// Rejected name
        op: String,
    },

    /// Weight quantization requested with a bit width other than 8, 16 or 32.
    #[error("Unsupported weight bit width {bits}: expected one of 8, 16, 32")]
    UnsupportedBitWidth {
        /// Rejected width
        bits: u32,
    },
}

/// Result alias used throughout the crate.
pub type LayerResult<T> = Result<T, LayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LayerError::ShapeMismatch {
            expected: vec![32, 64],
            actual: vec![32, 128],
        };
        assert!(err.to_string().contains("Shape mismatch"));

        let err = LayerError::InvalidInputDimension {
            expected: 64,
            actual: 128,
        };
        assert!(err.to_string().contains("Invalid input dimension"));

        let err = LayerError::UnsupportedInteraction { op: "sum".into() };
        assert!(err.to_string().contains("sum"));

        let err = LayerError::UnsupportedBitWidth { bits: 4 };
        assert!(err.to_string().contains("8, 16, 32"));
    }
}
