//! Embedding tables and their storage encodings.
//!
//! A table is a `rows x cols` matrix held either in full precision or as
//! row-wise quantized bytes. Quantized rows are decoded on the fly while
//! being accumulated, so a lookup never materializes the f32 matrix.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Int4RowCodec, Int8RowCodec, RowCodec};
use crate::error::{EmbeddingError, Result};

/// Storage encoding tag of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// f32 weights.
    Full,
    /// 8-bit row-wise quantized.
    Int8,
    /// 4-bit row-wise quantized.
    Int4,
}

impl Encoding {
    /// Bits per stored weight.
    pub fn bits(&self) -> u32 {
        match self {
            Encoding::Full => 32,
            Encoding::Int8 => 8,
            Encoding::Int4 => 4,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Full => write!(f, "full"),
            Encoding::Int8 => write!(f, "int8"),
            Encoding::Int4 => write!(f, "int4"),
        }
    }
}

/// Weight storage of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableStorage {
    /// Row-major f32 weights.
    Full(Vec<f32>),
    /// Packed 8-bit rows, each followed by its scale and bias.
    Int8(Vec<u8>),
    /// Packed 4-bit rows, each followed by its scale and bias.
    Int4(Vec<u8>),
}

/// One embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTable {
    rows: usize,
    cols: usize,
    storage: TableStorage,
}

impl EmbeddingTable {
    /// Creates a full-precision table from row-major weights.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::DimensionMismatch`] if `weights.len() != rows * cols`.
    pub fn from_weights(rows: usize, cols: usize, weights: Vec<f32>) -> Result<Self> {
        if weights.len() != rows * cols {
            return Err(EmbeddingError::DimensionMismatch {
                expected: rows * cols,
                actual: weights.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            storage: TableStorage::Full(weights),
        })
    }

    /// Creates a full-precision table of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            storage: TableStorage::Full(vec![0.0; rows * cols]),
        }
    }

    /// Wraps weights whose length is known to be `rows * cols`.
    pub(crate) fn from_full(rows: usize, cols: usize, weights: Vec<f32>) -> Self {
        debug_assert_eq!(weights.len(), rows * cols);
        Self {
            rows,
            cols,
            storage: TableStorage::Full(weights),
        }
    }

    /// Wraps packed bytes produced by a row codec.
    pub(crate) fn from_packed(rows: usize, cols: usize, storage: TableStorage) -> Self {
        Self {
            rows,
            cols,
            storage,
        }
    }

    /// Row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Vector width.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Storage encoding tag.
    pub fn encoding(&self) -> Encoding {
        match self.storage {
            TableStorage::Full(_) => Encoding::Full,
            TableStorage::Int8(_) => Encoding::Int8,
            TableStorage::Int4(_) => Encoding::Int4,
        }
    }

    /// Raw storage.
    pub fn storage(&self) -> &TableStorage {
        &self.storage
    }

    /// Bytes held by the weights.
    pub fn byte_size(&self) -> usize {
        match &self.storage {
            TableStorage::Full(w) => w.len() * std::mem::size_of::<f32>(),
            TableStorage::Int8(b) | TableStorage::Int4(b) => b.len(),
        }
    }

    /// Reads row `index`, decoding it if the table is quantized.
    ///
    /// Full-precision rows are returned exactly.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::RowOutOfBounds`] if `index >= rows`.
    pub fn row(&self, index: usize) -> Result<Vec<f32>> {
        if index >= self.rows {
            return Err(EmbeddingError::RowOutOfBounds {
                index,
                rows: self.rows,
            });
        }
        let mut out = vec![0.0; self.cols];
        self.accumulate_row(index, &mut out);
        Ok(out)
    }

    /// Adds row `index` into `out`.
    ///
    /// The caller has already checked `index < rows` and `out.len() == cols`.
    pub(crate) fn accumulate_row(&self, index: usize, out: &mut [f32]) {
        match &self.storage {
            TableStorage::Full(w) => {
                let row = &w[index * self.cols..(index + 1) * self.cols];
                for (o, v) in out.iter_mut().zip(row) {
                    *o += v;
                }
            }
            TableStorage::Int8(bytes) => {
                let stride = Int8RowCodec.row_bytes(self.cols);
                Int8RowCodec.accumulate(&bytes[index * stride..(index + 1) * stride], out);
            }
            TableStorage::Int4(bytes) => {
                let stride = Int4RowCodec.row_bytes(self.cols);
                Int4RowCodec.accumulate(&bytes[index * stride..(index + 1) * stride], out);
            }
        }
    }

    /// Full-precision weights, if the table is not quantized.
    pub fn weights(&self) -> Option<&[f32]> {
        match &self.storage {
            TableStorage::Full(w) => Some(w),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_row_read_is_exact() {
        let table = EmbeddingTable::from_weights(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(table.row(1).unwrap(), vec![4.0, 5.0, 6.0]);
        assert_eq!(table.encoding(), Encoding::Full);
        assert_eq!(table.byte_size(), 24);
    }

    #[test]
    fn test_row_out_of_bounds() {
        let table = EmbeddingTable::zeros(2, 3);
        assert!(matches!(
            table.row(2),
            Err(EmbeddingError::RowOutOfBounds { index: 2, rows: 2 })
        ));
    }

    #[test]
    fn test_from_weights_checks_length() {
        assert!(EmbeddingTable::from_weights(2, 3, vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_encoding_tags() {
        assert_eq!(Encoding::Int4.bits(), 4);
        assert_eq!(Encoding::Int8.to_string(), "int8");
        assert_eq!(serde_json::to_string(&Encoding::Full).unwrap(), "\"full\"");
    }
}
