//! Batched multi-table lookup with sum pooling.
//!
//! When every table in a store is a plain table with one shared shape and
//! encoding, the lookup runs over a single merged index space: table `t`'s
//! indices are shifted by `t * rows`, its offsets by the number of indices
//! of the tables before it, and one reduction pass covers every
//! `(table, batch row)` segment. The pooled rows are then split back into
//! one tensor per table. Any other store is reduced table by table. Both
//! paths produce the same values.

use dlrm_layers::Tensor;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::batch::SparseBatch;
use crate::error::{EmbeddingError, Result};
use crate::store::EmbeddingStore;

/// Runs sum-pooled lookups of a [`SparseBatch`] against an [`EmbeddingStore`].
///
/// # Example
///
/// ```
/// use dlrm_embedding::{BatchedLookupEngine, EmbeddingBag, EmbeddingStore, SparseBatch};
/// use dlrm_embedding::initializer::{RowIndexInit, TableInitializer};
///
/// let init = RowIndexInit { scale: 1.0 };
/// let store = EmbeddingStore::new(vec![
///     EmbeddingBag::Plain(init.init_table(4, 2, 0)),
///     EmbeddingBag::Plain(init.init_table(4, 2, 1)),
/// ]);
/// let batch = SparseBatch::new(vec![vec![0, 3], vec![1]], vec![vec![0, 1], vec![0, 1]]).unwrap();
///
/// let pooled = BatchedLookupEngine::default().lookup(&store, &batch).unwrap();
/// assert_eq!(pooled[0].data(), &[1.0, 1.0, 4.0, 4.0]);
/// assert_eq!(pooled[1].data(), &[2.0, 2.0, 0.0, 0.0]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BatchedLookupEngine {
    merge: bool,
}

impl Default for BatchedLookupEngine {
    fn default() -> Self {
        Self { merge: true }
    }
}

impl BatchedLookupEngine {
    /// Creates an engine that merges tables whenever the store allows it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine that always reduces table by table.
    pub fn per_table() -> Self {
        Self { merge: false }
    }

    /// Pools every segment of every table.
    ///
    /// Returns one `[batch_size, output_width]` tensor per bag, in store
    /// order. Empty segments pool to zero vectors.
    ///
    /// # Errors
    ///
    /// - [`EmbeddingError::TableCountMismatch`] if the batch does not carry
    ///   exactly one index list per bag
    /// - [`EmbeddingError::IndexOutOfBounds`] if any index is not a row of
    ///   its table; nothing is computed in that case
    pub fn lookup(&self, store: &EmbeddingStore, batch: &SparseBatch) -> Result<Vec<Tensor>> {
        self.validate(store, batch)?;
        if store.is_empty() {
            return Ok(Vec::new());
        }
        let merged = self.merge && store.is_mergeable();
        if self.merge && !merged && store.len() > 1 {
            warn!(
                tables = store.len(),
                "Tables differ in kind, shape or encoding; pooling each table separately"
            );
        }
        debug!(
            tables = store.len(),
            batch_size = batch.batch_size(),
            indices = batch.total_indices(),
            merged,
            "Embedding lookup"
        );
        if merged {
            Ok(self.lookup_merged(store, batch))
        } else {
            self.lookup_per_table(store, batch)
        }
    }

    fn validate(&self, store: &EmbeddingStore, batch: &SparseBatch) -> Result<()> {
        if batch.num_tables() != store.len() {
            return Err(EmbeddingError::TableCountMismatch {
                tables: store.len(),
                indices: batch.num_tables(),
                offsets: batch.num_tables(),
            });
        }
        for (t, entry) in store.entries().iter().enumerate() {
            let rows = entry.bag.rows();
            if let Some(&index) = batch.indices(t).iter().find(|&&i| i >= rows) {
                return Err(EmbeddingError::IndexOutOfBounds {
                    table: entry.global_index,
                    index,
                    rows,
                });
            }
        }
        Ok(())
    }

    fn lookup_per_table(&self, store: &EmbeddingStore, batch: &SparseBatch) -> Result<Vec<Tensor>> {
        store
            .entries()
            .par_iter()
            .enumerate()
            .map(|(t, entry)| entry.bag.pool(batch.indices(t), batch.offsets(t)))
            .collect()
    }

    /// Merge-then-split reduction. The store must be mergeable.
    fn lookup_merged(&self, store: &EmbeddingStore, batch: &SparseBatch) -> Vec<Tensor> {
        let tables: Vec<_> = store.bags().filter_map(|b| b.as_plain()).collect();
        let rows = tables[0].rows();
        let cols = tables[0].cols();
        let num_tables = tables.len();
        let batch_size = batch.batch_size();

        let mut indices = Vec::with_capacity(batch.total_indices());
        let mut offsets = Vec::with_capacity(num_tables * batch_size);
        for t in 0..num_tables {
            let base = indices.len();
            offsets.extend(batch.offsets(t).iter().map(|&o| o + base));
            indices.extend(batch.indices(t).iter().map(|&i| i + t * rows));
        }

        let mut pooled = vec![0.0f32; num_tables * batch_size * cols];
        if cols > 0 {
            pooled
                .par_chunks_mut(cols)
                .enumerate()
                .for_each(|(s, out)| {
                    let start = offsets[s];
                    let end = offsets.get(s + 1).copied().unwrap_or(indices.len());
                    for &g in &indices[start..end] {
                        tables[g / rows].accumulate_row(g % rows, out);
                    }
                });
        }

        let stride = batch_size * cols;
        (0..num_tables)
            .map(|t| {
                Tensor::from_data(&[batch_size, cols], pooled[t * stride..(t + 1) * stride].to_vec())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::EmbeddingBag;
    use crate::initializer::{RowIndexInit, TableInitializer, UniformTableInit};

    fn store(tables: usize, rows: usize, cols: usize) -> EmbeddingStore {
        EmbeddingStore::new(
            (0..tables)
                .map(|t| EmbeddingBag::Plain(UniformTableInit.init_table(rows, cols, t as u64)))
                .collect(),
        )
    }

    #[test]
    fn test_merged_matches_per_table() {
        let store = store(3, 6, 4);
        let batch = SparseBatch::new(
            vec![vec![0, 5, 2], vec![1, 1, 4, 3], vec![]],
            vec![vec![0, 2], vec![0, 1], vec![0, 0]],
        )
        .unwrap();
        let merged = BatchedLookupEngine::new().lookup(&store, &batch).unwrap();
        let split = BatchedLookupEngine::per_table().lookup(&store, &batch).unwrap();
        assert_eq!(merged.len(), 3);
        for (a, b) in merged.iter().zip(&split) {
            assert_eq!(a.shape(), &[2, 4]);
            assert!(a.max_abs_diff(b) < 1e-6);
        }
        assert!(merged[2].data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_out_of_bounds_reports_global_table() {
        let full = store(3, 4, 2);
        let shard = full.select(&[2]).unwrap();
        let batch = SparseBatch::new(vec![vec![4]], vec![vec![0]]).unwrap();
        let err = BatchedLookupEngine::new().lookup(&shard, &batch).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::IndexOutOfBounds {
                table: 2,
                index: 4,
                rows: 4
            }
        ));
    }

    #[test]
    fn test_table_count_mismatch() {
        let store = store(2, 4, 2);
        let batch = SparseBatch::new(vec![vec![0]], vec![vec![0]]).unwrap();
        assert!(matches!(
            BatchedLookupEngine::new().lookup(&store, &batch),
            Err(EmbeddingError::TableCountMismatch {
                tables: 2,
                indices: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_store_and_batch() {
        let empty = EmbeddingStore::default();
        let batch = SparseBatch::default();
        assert!(BatchedLookupEngine::new().lookup(&empty, &batch).unwrap().is_empty());

        let store = EmbeddingStore::new(vec![EmbeddingBag::Plain(
            RowIndexInit { scale: 1.0 }.init_table(3, 2, 0),
        )]);
        let zero_rows = SparseBatch::new(vec![vec![]], vec![vec![]]).unwrap();
        let out = BatchedLookupEngine::new().lookup(&store, &zero_rows).unwrap();
        assert_eq!(out[0].shape(), &[0, 2]);
    }
}
