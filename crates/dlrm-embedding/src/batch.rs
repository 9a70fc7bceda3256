//! Sparse batch representation.
//!
//! For every table `t` a batch carries a flat index list and one segment
//! start offset per batch row. Segment `i` spans
//! `indices[t][offsets[t][i]..offsets[t][i + 1]]`, the last segment running
//! to the end of the index list.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// Index and offset lists of every table for one forward call.
///
/// # Example
///
/// ```
/// use dlrm_embedding::batch::SparseBatch;
///
/// // Two tables, batch of two rows.
/// let batch = SparseBatch::new(
///     vec![vec![0, 1, 2], vec![4]],
///     vec![vec![0, 2], vec![0, 1]],
/// )
/// .unwrap();
/// assert_eq!(batch.batch_size(), 2);
/// assert_eq!(batch.segment(0, 0), &[0, 1]);
/// assert!(batch.segment(1, 1).is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawSparseBatch")]
pub struct SparseBatch {
    indices: Vec<Vec<usize>>,
    offsets: Vec<Vec<usize>>,
}

/// Unchecked wire form; deserialization goes through [`SparseBatch::new`].
#[derive(Deserialize)]
struct RawSparseBatch {
    indices: Vec<Vec<usize>>,
    offsets: Vec<Vec<usize>>,
}

impl TryFrom<RawSparseBatch> for SparseBatch {
    type Error = EmbeddingError;

    fn try_from(raw: RawSparseBatch) -> Result<Self> {
        Self::new(raw.indices, raw.offsets)
    }
}

impl SparseBatch {
    /// Creates a batch, checking its structure.
    ///
    /// # Errors
    ///
    /// - [`EmbeddingError::TableCountMismatch`] if the two lists differ in length
    /// - [`EmbeddingError::InvalidOffsets`] if an offset list decreases or
    ///   points past its index list
    /// - [`EmbeddingError::BatchSizeMismatch`] if tables disagree on the batch size
    pub fn new(indices: Vec<Vec<usize>>, offsets: Vec<Vec<usize>>) -> Result<Self> {
        if indices.len() != offsets.len() {
            return Err(EmbeddingError::TableCountMismatch {
                tables: indices.len().max(offsets.len()),
                indices: indices.len(),
                offsets: offsets.len(),
            });
        }
        let batch = offsets.first().map(Vec::len).unwrap_or(0);
        for (t, (idx, off)) in indices.iter().zip(&offsets).enumerate() {
            if off.len() != batch {
                return Err(EmbeddingError::BatchSizeMismatch {
                    table: t,
                    expected: batch,
                    actual: off.len(),
                });
            }
            if let Some(w) = off.windows(2).position(|w| w[0] > w[1]) {
                return Err(EmbeddingError::InvalidOffsets {
                    table: t,
                    message: format!("offset {} decreases ({} > {})", w + 1, off[w], off[w + 1]),
                });
            }
            if let Some(&last) = off.last() {
                if last > idx.len() {
                    return Err(EmbeddingError::InvalidOffsets {
                        table: t,
                        message: format!("offset {last} past {} indices", idx.len()),
                    });
                }
            }
        }
        Ok(Self { indices, offsets })
    }

    /// Builds a batch where every segment holds exactly `per_row` indices.
    pub fn fixed(indices: Vec<Vec<usize>>, per_row: usize) -> Result<Self> {
        let offsets = indices
            .iter()
            .map(|idx| {
                let rows = if per_row == 0 { 0 } else { idx.len() / per_row };
                (0..rows).map(|i| i * per_row).collect()
            })
            .collect();
        Self::new(indices, offsets)
    }

    /// Number of tables.
    pub fn num_tables(&self) -> usize {
        self.indices.len()
    }

    /// Batch size, 0 when there are no tables.
    pub fn batch_size(&self) -> usize {
        self.offsets.first().map(Vec::len).unwrap_or(0)
    }

    /// Flat index list of table `t`.
    pub fn indices(&self, t: usize) -> &[usize] {
        &self.indices[t]
    }

    /// Segment offsets of table `t`.
    pub fn offsets(&self, t: usize) -> &[usize] {
        &self.offsets[t]
    }

    /// Indices of segment `i` of table `t`.
    pub fn segment(&self, t: usize, i: usize) -> &[usize] {
        let start = self.offsets[t][i];
        let end = self.offsets[t]
            .get(i + 1)
            .copied()
            .unwrap_or(self.indices[t].len());
        &self.indices[t][start..end]
    }

    /// Total number of indices across all tables.
    pub fn total_indices(&self) -> usize {
        self.indices.iter().map(Vec::len).sum()
    }

    /// Keeps only tables in `range`.
    pub fn select_tables(&self, range: Range<usize>) -> SparseBatch {
        Self {
            indices: self.indices[range.clone()].to_vec(),
            offsets: self.offsets[range].to_vec(),
        }
    }

    /// Keeps only the listed tables, in the listed order.
    pub fn pick_tables(&self, tables: &[usize]) -> SparseBatch {
        Self {
            indices: tables.iter().map(|&t| self.indices[t].clone()).collect(),
            offsets: tables.iter().map(|&t| self.offsets[t].clone()).collect(),
        }
    }
}
