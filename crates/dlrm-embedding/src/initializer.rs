//! Embedding table initializers.
//!
//! Each table is filled from its own seed, so a table comes out identical
//! no matter which device or rank builds it and which other tables are
//! built alongside it.
//!
//! # Example
//!
//! ```
//! use dlrm_embedding::initializer::{TableInitializer, UniformTableInit};
//!
//! let a = UniformTableInit.init_table(10, 4, 7);
//! let b = UniformTableInit.init_table(10, 4, 7);
//! assert_eq!(a, b);
//! ```

use dlrm_layers::Initializer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::table::EmbeddingTable;

/// Exclusive upper bound of per-table seeds.
pub const TABLE_SEED_RANGE: u64 = 100_000;

/// Draws one seed per table from `rng`.
///
/// Every rank draws all `count` seeds even when it builds only a subset of
/// the tables, which keeps the generator in step across ranks.
pub fn table_seeds(rng: &mut StdRng, count: usize) -> Vec<u64> {
    (0..count).map(|_| rng.gen_range(0..TABLE_SEED_RANGE)).collect()
}

/// Strategy that fills a new table.
pub trait TableInitializer: Send + Sync {
    /// Creates a `rows x cols` table from `seed`.
    fn init_table(&self, rows: usize, cols: usize, seed: u64) -> EmbeddingTable;

    /// Returns the name of this initializer.
    fn name(&self) -> &str;
}

/// Uniform in `[-sqrt(1/rows), sqrt(1/rows))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformTableInit;

impl UniformTableInit {
    /// Bound used for a table of `rows` rows.
    pub fn bound(rows: usize) -> f32 {
        (1.0 / rows.max(1) as f32).sqrt()
    }
}

impl TableInitializer for UniformTableInit {
    fn init_table(&self, rows: usize, cols: usize, seed: u64) -> EmbeddingTable {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = Self::bound(rows);
        let weights = Initializer::Uniform {
            low: -bound,
            high: bound,
        }
        .initialize(&[rows, cols], &mut rng);
        EmbeddingTable::from_full(rows, cols, weights.into_data())
    }

    fn name(&self) -> &str {
        "uniform"
    }
}

/// Fills every weight with the same value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantTableInit(pub f32);

impl TableInitializer for ConstantTableInit {
    fn init_table(&self, rows: usize, cols: usize, _seed: u64) -> EmbeddingTable {
        EmbeddingTable::from_full(rows, cols, vec![self.0; rows * cols])
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Row `i` of every table is filled with `(i + 1) * scale`.
///
/// Handy for tests that need distinguishable rows with known sums.
#[derive(Debug, Clone, Copy)]
pub struct RowIndexInit {
    /// Multiplier applied to the 1-based row number.
    pub scale: f32,
}

impl TableInitializer for RowIndexInit {
    fn init_table(&self, rows: usize, cols: usize, _seed: u64) -> EmbeddingTable {
        let weights = (0..rows)
            .flat_map(|r| std::iter::repeat((r + 1) as f32 * self.scale).take(cols))
            .collect();
        EmbeddingTable::from_full(rows, cols, weights)
    }

    fn name(&self) -> &str {
        "row_index"
    }
}
