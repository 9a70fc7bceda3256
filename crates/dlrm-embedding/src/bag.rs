//! Sum-pooled embedding bags.
//!
//! A bag turns the index segments of one sparse feature into one vector per
//! batch row. Besides plain tables there are two memory-saving variants:
//!
//! - **Quotient-remainder**: index `i` reads row `i / c` of a quotient table
//!   and row `i % c` of a remainder table, and the two pooled vectors are
//!   combined by product, sum or concatenation.
//! - **Mixed-dimension**: a narrow table whose pooled vector is projected up
//!   to the shared width by a bias-free linear map.

use std::fmt;
use std::str::FromStr;

use dlrm_layers::{Dense, Initializer, Layer, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{EmbeddingError, Result};
use crate::initializer::{TableInitializer, TABLE_SEED_RANGE};
use crate::table::{EmbeddingTable, Encoding};

/// How the quotient and remainder vectors are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrOperation {
    /// Elementwise product.
    #[default]
    Mult,
    /// Elementwise sum.
    Add,
    /// Concatenation, doubling the width.
    Concat,
}

impl FromStr for QrOperation {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mult" => Ok(Self::Mult),
            "add" => Ok(Self::Add),
            "concat" => Ok(Self::Concat),
            other => Err(EmbeddingError::Config {
                message: format!("unknown quotient-remainder operation {other:?}"),
            }),
        }
    }
}

impl fmt::Display for QrOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mult => write!(f, "mult"),
            Self::Add => write!(f, "add"),
            Self::Concat => write!(f, "concat"),
        }
    }
}

/// Quotient-remainder bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrBag {
    rows: usize,
    collisions: usize,
    operation: QrOperation,
    quotient: EmbeddingTable,
    remainder: EmbeddingTable,
}

impl QrBag {
    /// Builds a bag for `rows` categories of width `dim`.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Config`] if `collisions` is zero.
    pub fn new(
        rows: usize,
        dim: usize,
        collisions: usize,
        operation: QrOperation,
        init: &dyn TableInitializer,
        seed: u64,
    ) -> Result<Self> {
        if collisions == 0 {
            return Err(EmbeddingError::Config {
                message: "quotient-remainder collisions must be positive".to_string(),
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let q_seed = rng.gen_range(0..TABLE_SEED_RANGE);
        let r_seed = rng.gen_range(0..TABLE_SEED_RANGE);
        Ok(Self {
            rows,
            collisions,
            operation,
            quotient: init.init_table(rows.div_ceil(collisions), dim, q_seed),
            remainder: init.init_table(collisions, dim, r_seed),
        })
    }

    /// Number of hash collisions per quotient row.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// Combination operator.
    pub fn operation(&self) -> QrOperation {
        self.operation
    }

    /// Quotient table, `ceil(rows / collisions)` rows.
    pub fn quotient(&self) -> &EmbeddingTable {
        &self.quotient
    }

    /// Remainder table, `collisions` rows.
    pub fn remainder(&self) -> &EmbeddingTable {
        &self.remainder
    }
}

/// Mixed-dimension bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdBag {
    table: EmbeddingTable,
    projection: Option<Dense>,
}

impl MdBag {
    /// Builds a `rows x dim` table, projected to `base_dim` when narrower.
    pub fn new(
        rows: usize,
        dim: usize,
        base_dim: usize,
        init: &dyn TableInitializer,
        seed: u64,
    ) -> Result<Self> {
        if dim == 0 || dim > base_dim {
            return Err(EmbeddingError::Config {
                message: format!("mixed-dimension width {dim} must be in 1..={base_dim}"),
            });
        }
        let table = init.init_table(rows, dim, seed);
        let projection = if dim < base_dim {
            // Glorot uniform.
            let mut rng = StdRng::seed_from_u64(seed);
            let limit = (6.0 / (dim + base_dim) as f32).sqrt();
            let kernel = Initializer::Uniform {
                low: -limit,
                high: limit,
            }
            .initialize(&[dim, base_dim], &mut rng);
            Some(Dense::from_weights(kernel, None)?)
        } else {
            None
        };
        Ok(Self { table, projection })
    }

    /// Builds a bag from an explicit table and projection.
    pub fn from_parts(table: EmbeddingTable, projection: Option<Dense>) -> Result<Self> {
        if let Some(p) = &projection {
            if p.in_features() != table.cols() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: table.cols(),
                    actual: p.in_features(),
                });
            }
        }
        Ok(Self { table, projection })
    }

    /// The narrow table.
    pub fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    /// Projection to the shared width, if the table is narrower.
    pub fn projection(&self) -> Option<&Dense> {
        self.projection.as_ref()
    }
}

/// One sparse feature's lookup structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmbeddingBag {
    /// A single table.
    Plain(EmbeddingTable),
    /// Quotient and remainder tables.
    QuotientRemainder(QrBag),
    /// A narrow table with an up-projection.
    MixedDim(MdBag),
}

impl EmbeddingBag {
    /// Logical row count, the bound on valid indices.
    pub fn rows(&self) -> usize {
        match self {
            Self::Plain(t) => t.rows(),
            Self::QuotientRemainder(qr) => qr.rows,
            Self::MixedDim(md) => md.table.rows(),
        }
    }

    /// Width of the pooled vector.
    pub fn output_width(&self) -> usize {
        match self {
            Self::Plain(t) => t.cols(),
            Self::QuotientRemainder(qr) => match qr.operation {
                QrOperation::Concat => 2 * qr.quotient.cols(),
                _ => qr.quotient.cols(),
            },
            Self::MixedDim(md) => md
                .projection
                .as_ref()
                .map(Dense::out_features)
                .unwrap_or(md.table.cols()),
        }
    }

    /// Width of the stored rows.
    pub fn storage_width(&self) -> usize {
        match self {
            Self::Plain(t) => t.cols(),
            Self::QuotientRemainder(qr) => qr.quotient.cols(),
            Self::MixedDim(md) => md.table.cols(),
        }
    }

    /// Storage encoding of the bag's tables.
    pub fn encoding(&self) -> Encoding {
        match self {
            Self::Plain(t) => t.encoding(),
            _ => Encoding::Full,
        }
    }

    /// Short name of the bag variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::QuotientRemainder(_) => "quotient-remainder",
            Self::MixedDim(_) => "mixed-dimension",
        }
    }

    /// The table of a plain bag.
    pub fn as_plain(&self) -> Option<&EmbeddingTable> {
        match self {
            Self::Plain(t) => Some(t),
            _ => None,
        }
    }

    /// Bytes held by the bag's weights.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Plain(t) => t.byte_size(),
            Self::QuotientRemainder(qr) => qr.quotient.byte_size() + qr.remainder.byte_size(),
            Self::MixedDim(md) => md.table.byte_size() + md.projection.as_ref().map_or(0, |p| {
                p.in_features() * p.out_features() * std::mem::size_of::<f32>()
            }),
        }
    }

    /// Returns a copy whose table is quantized to `bits` (4 or 8).
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::IncompatibleTrick`] for quotient-remainder
    /// and mixed-dimension bags, and any codec error for plain ones.
    pub fn quantize(&self, bits: u32) -> Result<EmbeddingBag> {
        match self {
            Self::Plain(t) => Ok(Self::Plain(codec::quantize(t, bits)?)),
            Self::QuotientRemainder(_) => Err(EmbeddingError::IncompatibleTrick {
                bits,
                trick: "quotient-remainder",
            }),
            Self::MixedDim(_) => Err(EmbeddingError::IncompatibleTrick {
                bits,
                trick: "mixed-dimension",
            }),
        }
    }

    /// Sum-pools every segment of `offsets` into a `[batch, output_width]` tensor.
    ///
    /// Indices must already be checked against [`EmbeddingBag::rows`].
    pub(crate) fn pool(&self, indices: &[usize], offsets: &[usize]) -> Result<Tensor> {
        let batch = offsets.len();
        match self {
            Self::Plain(t) => {
                let mut out = vec![0.0; batch * t.cols()];
                segment_sum(t, indices, offsets, |i| i, &mut out);
                Ok(Tensor::from_data(&[batch, t.cols()], out))
            }
            Self::QuotientRemainder(qr) => {
                let d = qr.quotient.cols();
                let c = qr.collisions;
                let mut q = vec![0.0; batch * d];
                let mut r = vec![0.0; batch * d];
                segment_sum(&qr.quotient, indices, offsets, |i| i / c, &mut q);
                segment_sum(&qr.remainder, indices, offsets, |i| i % c, &mut r);
                let q = Tensor::from_data(&[batch, d], q);
                let r = Tensor::from_data(&[batch, d], r);
                Ok(match qr.operation {
                    QrOperation::Mult => {
                        let data = q.data().iter().zip(r.data()).map(|(a, b)| a * b).collect();
                        Tensor::from_data(&[batch, d], data)
                    }
                    QrOperation::Add => q.add(&r),
                    QrOperation::Concat => Tensor::concat_cols(&[&q, &r])?,
                })
            }
            Self::MixedDim(md) => {
                let d = md.table.cols();
                let mut out = vec![0.0; batch * d];
                segment_sum(&md.table, indices, offsets, |i| i, &mut out);
                let pooled = Tensor::from_data(&[batch, d], out);
                match &md.projection {
                    Some(p) => Ok(p.forward(&pooled)?),
                    None => Ok(pooled),
                }
            }
        }
    }
}

/// Adds `table[map(idx)]` for every index of segment `i` into row `i` of `out`.
///
/// Segment `i` spans `indices[offsets[i]..offsets[i + 1]]`, the last one
/// running to the end of `indices`. Empty segments leave their row at zero.
pub(crate) fn segment_sum<F>(
    table: &EmbeddingTable,
    indices: &[usize],
    offsets: &[usize],
    map: F,
    out: &mut [f32],
) where
    F: Fn(usize) -> usize + Sync,
{
    let cols = table.cols();
    if cols == 0 {
        return;
    }
    out.par_chunks_mut(cols)
        .enumerate()
        .for_each(|(i, row)| {
            let start = offsets[i];
            let end = offsets.get(i + 1).copied().unwrap_or(indices.len());
            for &idx in &indices[start..end] {
                table.accumulate_row(map(idx), row);
            }
        });
}
