//! Seeded synthetic inputs for benchmarks.
//!
//! Dense features are uniform in `[0, 1)`. Every segment holds distinct,
//! sorted indices: exactly `indices_per_lookup` of them in fixed mode,
//! otherwise between 1 and `indices_per_lookup`, in both cases capped at
//! the table's row count.

use anyhow::{Context, Result};
use dlrm_embedding::SparseBatch;
use dlrm_engine::ModelConfig;
use dlrm_layers::Tensor;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

/// Generator of random `(dense, sparse)` batches for one model shape.
#[derive(Debug, Clone)]
pub struct SyntheticBatches {
    rng: StdRng,
    dense_features: usize,
    rows: Vec<usize>,
    batch_size: usize,
    indices_per_lookup: usize,
    fixed: bool,
}

impl SyntheticBatches {
    /// Creates a generator for batches of `batch_size` rows.
    pub fn new(
        config: &ModelConfig,
        batch_size: usize,
        indices_per_lookup: usize,
        fixed: bool,
        seed: u64,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dense_features: config.dense_features(),
            rows: config.embedding_rows.clone(),
            batch_size,
            indices_per_lookup: indices_per_lookup.max(1),
            fixed,
        }
    }

    /// Draws the next batch.
    pub fn next_batch(&mut self) -> Result<(Tensor, SparseBatch)> {
        let n = self.batch_size * self.dense_features;
        let values = (0..n).map(|_| self.rng.gen::<f32>()).collect();
        let dense = Tensor::try_from_data(&[self.batch_size, self.dense_features], values)
            .context("Failed to build dense batch")?;

        let mut indices = Vec::with_capacity(self.rows.len());
        let mut offsets = Vec::with_capacity(self.rows.len());
        for &rows in &self.rows {
            let cap = self.indices_per_lookup.min(rows);
            let mut idx = Vec::with_capacity(self.batch_size * cap);
            let mut off = Vec::with_capacity(self.batch_size);
            for _ in 0..self.batch_size {
                off.push(idx.len());
                let count = if self.fixed || cap <= 1 {
                    cap
                } else {
                    self.rng.gen_range(1..=cap)
                };
                let mut segment = index::sample(&mut self.rng, rows, count).into_vec();
                segment.sort_unstable();
                idx.extend(segment);
            }
            indices.push(idx);
            offsets.push(off);
        }
        let sparse = SparseBatch::new(indices, offsets).context("Failed to build sparse batch")?;
        Ok((dense, sparse))
    }

    /// Draws `count` batches.
    pub fn take_batches(&mut self, count: usize) -> Result<Vec<(Tensor, SparseBatch)>> {
        (0..count).map(|_| self.next_batch()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig::new(2, vec![4, 3, 100], vec![5, 2], vec![8, 1])
    }

    #[test]
    fn test_fixed_segments() {
        let mut batches = SyntheticBatches::new(&config(), 6, 3, true, 7);
        let (dense, sparse) = batches.next_batch().unwrap();
        assert_eq!(dense.shape(), &[6, 5]);
        assert!(dense.data().iter().all(|v| (0.0..1.0).contains(v)));
        assert_eq!(sparse.batch_size(), 6);
        assert_eq!(sparse.indices(0).len(), 18);
        assert_eq!(sparse.indices(1).len(), 18);
        for i in 0..6 {
            let seg = sparse.segment(2, i);
            assert_eq!(seg.len(), 3);
            assert!(seg.windows(2).all(|w| w[0] < w[1]));
            assert!(seg.iter().all(|&x| x < 100));
        }
    }

    #[test]
    fn test_random_segments_are_nonempty_and_capped() {
        let mut batches = SyntheticBatches::new(&config(), 20, 10, false, 3);
        let (_, sparse) = batches.next_batch().unwrap();
        for t in 0..3 {
            let cap = [4, 3, 10][t];
            for i in 0..20 {
                let len = sparse.segment(t, i).len();
                assert!((1..=cap).contains(&len));
            }
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let a = SyntheticBatches::new(&config(), 4, 2, false, 11)
            .take_batches(3)
            .unwrap();
        let b = SyntheticBatches::new(&config(), 4, 2, false, 11)
            .take_batches(3)
            .unwrap();
        for ((da, sa), (db, sb)) in a.iter().zip(&b) {
            assert_eq!(da, db);
            assert_eq!(sa, sb);
        }
    }
}
