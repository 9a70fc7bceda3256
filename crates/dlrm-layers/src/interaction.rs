//! Feature interaction between the dense encoding and the pooled embeddings.
//!
//! The dense vector and the `T` lookup vectors form `F = T + 1` features of
//! width `d`. Two operators combine them:
//!
//! - `cat`: the features are concatenated in table order, width `F * d`.
//! - `dot`: pairwise dot products of the features (the Gram matrix), of which
//!   the lower triangle is scanned row-major and appended to the dense vector.
//!   With self-interaction the diagonal is kept, width `d + F(F+1)/2`;
//!   without it, width `d + F(F-1)/2`.
//!
//! A projected `dot` variant replaces the Gram matrix with `T_b * P(T_b^T)`
//! where `P` is a learned `F -> p` map, giving width `d + F * p`.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::dense::Dense;
use crate::error::{LayerError, LayerResult};
use crate::initializer::WeightInit;
use crate::layer::Layer;
use crate::tensor::Tensor;

/// Interaction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionOp {
    /// Pairwise dot products.
    #[default]
    Dot,
    /// Concatenation.
    Cat,
}

impl FromStr for InteractionOp {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dot" => Ok(Self::Dot),
            "cat" => Ok(Self::Cat),
            other => Err(LayerError::UnsupportedInteraction {
                op: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for InteractionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dot => write!(f, "dot"),
            Self::Cat => write!(f, "cat"),
        }
    }
}

/// Output width of the interaction for `num_features` features of width `dim`.
///
/// `num_features` counts the dense vector, so a model with `T` tables passes
/// `T + 1`. A `projection` of 0 disables the projected variant.
///
/// ```
/// use dlrm_layers::interaction::{interaction_width, InteractionOp};
///
/// assert_eq!(interaction_width(InteractionOp::Dot, 3, 4, false, 0), 7);
/// assert_eq!(interaction_width(InteractionOp::Dot, 3, 4, true, 0), 10);
/// assert_eq!(interaction_width(InteractionOp::Cat, 4, 4, false, 0), 16);
/// ```
pub fn interaction_width(
    op: InteractionOp,
    num_features: usize,
    dim: usize,
    self_interaction: bool,
    projection: usize,
) -> usize {
    match op {
        InteractionOp::Cat => num_features * dim,
        InteractionOp::Dot if projection > 0 => dim + num_features * projection,
        InteractionOp::Dot if self_interaction => dim + num_features * (num_features + 1) / 2,
        InteractionOp::Dot => dim + num_features * num_features.saturating_sub(1) / 2,
    }
}

/// Interaction over a fixed number of tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    op: InteractionOp,
    self_interaction: bool,
    /// `F -> p` map of the projected variant
    projection: Option<Dense>,
    num_tables: usize,
    dim: usize,
}

impl Interaction {
    /// Creates an interaction over `num_tables` lookup vectors of width `dim`.
    pub fn new(op: InteractionOp, self_interaction: bool, num_tables: usize, dim: usize) -> Self {
        Self {
            op,
            self_interaction,
            projection: None,
            num_tables,
            dim,
        }
    }

    /// Enables the projected dot variant with a learned `F -> size` map.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ConfigError`] when the operator is not `dot`.
    pub fn with_projection(
        mut self,
        size: usize,
        init: &dyn WeightInit,
        rng: &mut StdRng,
    ) -> LayerResult<Self> {
        if size == 0 {
            self.projection = None;
            return Ok(self);
        }
        if self.op != InteractionOp::Dot {
            return Err(LayerError::ConfigError {
                message: format!("projection requires the dot interaction, got {}", self.op),
            });
        }
        let features = self.num_features();
        self.projection = Some(Dense::new_with_initializer(features, size, init, true, rng));
        Ok(self)
    }

    /// Interaction operator.
    pub fn op(&self) -> InteractionOp {
        self.op
    }

    /// Whether the Gram diagonal is kept.
    pub fn self_interaction(&self) -> bool {
        self.self_interaction
    }

    /// Number of features including the dense vector.
    pub fn num_features(&self) -> usize {
        self.num_tables + 1
    }

    /// Width of the projected features, 0 when disabled.
    pub fn projection_size(&self) -> usize {
        self.projection.as_ref().map(Dense::out_features).unwrap_or(0)
    }

    /// Output width.
    pub fn output_width(&self) -> usize {
        interaction_width(
            self.op,
            self.num_features(),
            self.dim,
            self.self_interaction,
            self.projection_size(),
        )
    }

    /// Combines `dense` (`[batch, d]`) with one `[batch, d]` tensor per table.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] when the table count or any
    /// shape disagrees with the configuration.
    pub fn forward(&self, dense: &Tensor, sparse: &[Tensor]) -> LayerResult<Tensor> {
        let batch = dense.rows();
        if dense.ndim() != 2 || dense.cols() != self.dim {
            return Err(LayerError::ShapeMismatch {
                expected: vec![batch, self.dim],
                actual: dense.shape().to_vec(),
            });
        }
        if sparse.len() != self.num_tables {
            return Err(LayerError::ShapeMismatch {
                expected: vec![self.num_tables],
                actual: vec![sparse.len()],
            });
        }
        for t in sparse {
            if t.shape() != [batch, self.dim] {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![batch, self.dim],
                    actual: t.shape().to_vec(),
                });
            }
        }

        match (self.op, &self.projection) {
            (InteractionOp::Cat, _) => {
                let mut parts = Vec::with_capacity(sparse.len() + 1);
                parts.push(dense);
                parts.extend(sparse.iter());
                Tensor::concat_cols(&parts)
            }
            (InteractionOp::Dot, Some(proj)) => self.projected(dense, sparse, proj),
            (InteractionOp::Dot, None) => Ok(self.triangular(dense, sparse)),
        }
    }

    fn features<'a>(&self, dense: &'a Tensor, sparse: &'a [Tensor], b: usize) -> Vec<&'a [f32]> {
        std::iter::once(dense.row(b))
            .chain(sparse.iter().map(|t| t.row(b)))
            .collect()
    }

    fn triangular(&self, dense: &Tensor, sparse: &[Tensor]) -> Tensor {
        let batch = dense.rows();
        let width = self.output_width();
        let offset = usize::from(self.self_interaction);
        let mut out = Vec::with_capacity(batch * width);
        for b in 0..batch {
            let feats = self.features(dense, sparse, b);
            out.extend_from_slice(feats[0]);
            for i in 0..feats.len() {
                for j in 0..i + offset {
                    out.push(dot(feats[i], feats[j]));
                }
            }
        }
        Tensor::from_data(&[batch, width], out)
    }

    fn projected(&self, dense: &Tensor, sparse: &[Tensor], proj: &Dense) -> LayerResult<Tensor> {
        let batch = dense.rows();
        let (f, d, p) = (self.num_features(), self.dim, proj.out_features());

        // Rows of the transposed feature stacks: one [F] row per (batch, column).
        let mut stacked = Vec::with_capacity(batch * d * f);
        for b in 0..batch {
            let feats = self.features(dense, sparse, b);
            for k in 0..d {
                stacked.extend(feats.iter().map(|row| row[k]));
            }
        }
        let reduced = proj.forward(&Tensor::from_data(&[batch * d, f], stacked))?;

        let width = self.output_width();
        let mut out = Vec::with_capacity(batch * width);
        for b in 0..batch {
            let feats = self.features(dense, sparse, b);
            out.extend_from_slice(feats[0]);
            let tr = &reduced.data()[b * d * p..(b + 1) * d * p];
            for feat in &feats {
                for q in 0..p {
                    out.push((0..d).map(|k| feat[k] * tr[k * p + q]).sum());
                }
            }
        }
        Ok(Tensor::from_data(&[batch, width], out))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::ConstantWeights;
    use rand::SeedableRng;

    fn t(rows: usize, data: Vec<f32>) -> Tensor {
        let cols = data.len() / rows;
        Tensor::from_data(&[rows, cols], data)
    }

    #[test]
    fn test_parse_op() {
        assert_eq!("dot".parse::<InteractionOp>().unwrap(), InteractionOp::Dot);
        assert_eq!("cat".parse::<InteractionOp>().unwrap(), InteractionOp::Cat);
        assert!(matches!(
            "sum".parse::<InteractionOp>(),
            Err(LayerError::UnsupportedInteraction { .. })
        ));
    }

    #[test]
    fn test_widths_three_features() {
        let f = 3;
        assert_eq!(interaction_width(InteractionOp::Dot, f, 4, false, 0), 4 + 3);
        assert_eq!(interaction_width(InteractionOp::Dot, f, 4, true, 0), 4 + 6);
        assert_eq!(interaction_width(InteractionOp::Dot, f, 4, false, 2), 4 + 6);
        assert_eq!(interaction_width(InteractionOp::Cat, 4, 4, false, 0), 16);
    }

    #[test]
    fn test_dot_lower_triangle_order() {
        // features: x=[1,0], e1=[0,2], e2=[1,1]
        let x = t(1, vec![1.0, 0.0]);
        let e1 = t(1, vec![0.0, 2.0]);
        let e2 = t(1, vec![1.0, 1.0]);

        let excl = Interaction::new(InteractionOp::Dot, false, 2, 2);
        let out = excl.forward(&x, &[e1.clone(), e2.clone()]).unwrap();
        // x, then (1,0), (2,0), (2,1)
        assert_eq!(out.data(), &[1.0, 0.0, 0.0, 1.0, 2.0]);

        let incl = Interaction::new(InteractionOp::Dot, true, 2, 2);
        let out = incl.forward(&x, &[e1, e2]).unwrap();
        // x, then (0,0), (1,0), (1,1), (2,0), (2,1), (2,2)
        assert_eq!(out.data(), &[1.0, 0.0, 1.0, 0.0, 4.0, 1.0, 2.0, 2.0]);
        assert_eq!(out.cols(), incl.output_width());
    }

    #[test]
    fn test_cat_concatenates_in_table_order() {
        let x = t(2, vec![1.0, 2.0, 3.0, 4.0]);
        let e1 = t(2, vec![5.0, 6.0, 7.0, 8.0]);
        let cat = Interaction::new(InteractionOp::Cat, false, 1, 2);
        let out = cat.forward(&x, &[e1]).unwrap();
        assert_eq!(out.shape(), &[2, 4]);
        assert_eq!(out.row(1), &[3.0, 4.0, 7.0, 8.0]);
    }

    #[test]
    fn test_zero_tables_returns_dense() {
        let x = t(2, vec![1.0, 2.0, 3.0, 4.0]);
        for op in [InteractionOp::Dot, InteractionOp::Cat] {
            let inter = Interaction::new(op, false, 0, 2);
            assert_eq!(inter.forward(&x, &[]).unwrap(), x);
        }
    }

    #[test]
    fn test_zero_tables_self_interaction_appends_norm() {
        let x = t(2, vec![1.0, 2.0, 3.0, 4.0]);
        let inter = Interaction::new(InteractionOp::Dot, true, 0, 2);
        assert_eq!(inter.output_width(), 3);
        assert_eq!(interaction_width(InteractionOp::Dot, 1, 2, true, 0), 3);
        let out = inter.forward(&x, &[]).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.row(0), &[1.0, 2.0, 5.0]);
        assert_eq!(out.row(1), &[3.0, 4.0, 25.0]);
    }

    #[test]
    fn test_projection_matches_manual_product() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = ConstantWeights {
            kernel: 1.0,
            bias: 0.0,
        };
        let inter = Interaction::new(InteractionOp::Dot, false, 1, 2)
            .with_projection(1, &init, &mut rng)
            .unwrap();
        let x = t(1, vec![1.0, 2.0]);
        let e = t(1, vec![3.0, 4.0]);
        // TR = [x0+e0, x1+e1] = [4, 6]; Z = [1*4+2*6, 3*4+4*6] = [16, 36]
        let out = inter.forward(&x, &[e]).unwrap();
        assert_eq!(out.data(), &[1.0, 2.0, 16.0, 36.0]);
        assert_eq!(inter.output_width(), 4);
    }

    #[test]
    fn test_projection_requires_dot() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = ConstantWeights {
            kernel: 1.0,
            bias: 0.0,
        };
        assert!(Interaction::new(InteractionOp::Cat, false, 2, 4)
            .with_projection(2, &init, &mut rng)
            .is_err());
    }

    #[test]
    fn test_shape_checks() {
        let inter = Interaction::new(InteractionOp::Dot, false, 2, 2);
        let x = Tensor::zeros(&[3, 2]);
        assert!(inter.forward(&x, &[Tensor::zeros(&[3, 2])]).is_err());
        assert!(inter
            .forward(&x, &[Tensor::zeros(&[3, 2]), Tensor::zeros(&[2, 2])])
            .is_err());
    }
}
