//! Dense (fully connected) layer implementation.
//!
//! This module provides the [`Dense`] layer, which performs a linear transformation
//! `y = xW + b` where W is the weight matrix and b is the bias vector. The
//! weight matrix may be held in full precision, half precision, or as int8
//! codes with one scale per output column.

use half::f16;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};
use crate::initializer::WeightInit;
use crate::layer::Layer;
use crate::tensor::Tensor;

/// Storage of a dense kernel of shape `[in_features, out_features]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DenseWeights {
    /// Full precision.
    F32(Tensor),
    /// IEEE half precision, row-major.
    F16(Vec<f16>),
    /// Symmetric int8 codes, row-major, with one scale per output column.
    Int8 {
        /// Quantized codes.
        codes: Vec<i8>,
        /// Per-column dequantization scale.
        scales: Vec<f32>,
    },
}

impl DenseWeights {
    /// Bit width of the stored weights.
    pub fn bits(&self) -> u32 {
        match self {
            DenseWeights::F32(_) => 32,
            DenseWeights::F16(_) => 16,
            DenseWeights::Int8 { .. } => 8,
        }
    }
}

/// A dense (fully connected) layer.
///
/// Performs the transformation `y = xW + b` where:
/// - `x` is the input tensor of shape `[batch_size, in_features]`
/// - `W` is the weight matrix of shape `[in_features, out_features]`
/// - `b` is the bias vector of shape `[out_features]`
///
/// # Example
///
/// ```
/// use dlrm_layers::dense::Dense;
/// use dlrm_layers::layer::Layer;
/// use dlrm_layers::tensor::Tensor;
///
/// let layer = Dense::zeros(128, 64, true);
/// let input = Tensor::zeros(&[32, 128]); // batch of 32
/// let output = layer.forward(&input).unwrap();
/// assert_eq!(output.shape(), &[32, 64]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// Kernel storage
    weights: DenseWeights,
    /// Bias vector of shape [out_features], absent for bias-free projections
    bias: Option<Tensor>,
    /// Input feature dimension
    in_features: usize,
    /// Output feature dimension
    out_features: usize,
}

impl Dense {
    /// Creates a dense layer whose weights come from `init`.
    ///
    /// # Arguments
    ///
    /// * `in_features` - Number of input features
    /// * `out_features` - Number of output features
    /// * `init` - Kernel and bias initializer
    /// * `use_bias` - Whether to add a bias
    /// * `rng` - Seeded generator the initializer draws from
    pub fn new_with_initializer(
        in_features: usize,
        out_features: usize,
        init: &dyn WeightInit,
        use_bias: bool,
        rng: &mut StdRng,
    ) -> Self {
        let weights = init.kernel(in_features, out_features, rng);
        let bias = use_bias.then(|| init.bias(out_features, rng));
        Self {
            weights: DenseWeights::F32(weights),
            bias,
            in_features,
            out_features,
        }
    }

    /// Creates a dense layer with all-zero weights.
    pub fn zeros(in_features: usize, out_features: usize, use_bias: bool) -> Self {
        Self {
            weights: DenseWeights::F32(Tensor::zeros(&[in_features, out_features])),
            bias: use_bias.then(|| Tensor::zeros(&[out_features])),
            in_features,
            out_features,
        }
    }

    /// Creates a dense layer from explicit weights.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] if `weights` is not 2D or the
    /// bias length differs from the kernel's output width.
    pub fn from_weights(weights: Tensor, bias: Option<Tensor>) -> LayerResult<Self> {
        if weights.ndim() != 2 {
            return Err(LayerError::ShapeMismatch {
                expected: vec![0, 0],
                actual: weights.shape().to_vec(),
            });
        }
        let (in_features, out_features) = (weights.shape()[0], weights.shape()[1]);
        if let Some(b) = &bias {
            if b.shape() != [out_features] {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![out_features],
                    actual: b.shape().to_vec(),
                });
            }
        }
        Ok(Self {
            weights: DenseWeights::F32(weights),
            bias,
            in_features,
            out_features,
        })
    }

    /// Returns the input dimension.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Returns the output dimension.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Returns the kernel storage.
    pub fn weights(&self) -> &DenseWeights {
        &self.weights
    }

    /// Returns the bias, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Bit width of the kernel (8, 16 or 32).
    pub fn bits(&self) -> u32 {
        self.weights.bits()
    }

    /// Reconstructs the kernel in f32.
    pub fn dequantized_weights(&self) -> Tensor {
        let shape = [self.in_features, self.out_features];
        match &self.weights {
            DenseWeights::F32(w) => w.clone(),
            DenseWeights::F16(w) => Tensor::from_data(&shape, w.iter().map(|v| v.to_f32()).collect()),
            DenseWeights::Int8 { codes, scales } => {
                let n = self.out_features;
                let data = codes
                    .iter()
                    .enumerate()
                    .map(|(idx, &c)| c as f32 * scales[idx % n])
                    .collect();
                Tensor::from_data(&shape, data)
            }
        }
    }

    /// Returns a copy of this layer with its kernel stored at `bits` precision.
    ///
    /// 32 keeps f32, 16 stores half precision, 8 stores symmetric int8 with
    /// one scale per output column. The bias stays in f32.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::UnsupportedBitWidth`] for any other width.
    pub fn quantize(&self, bits: u32) -> LayerResult<Dense> {
        let full = self.dequantized_weights();
        let weights = match bits {
            32 => DenseWeights::F32(full),
            16 => DenseWeights::F16(full.data().iter().map(|&v| f16::from_f32(v)).collect()),
            8 => {
                let n = self.out_features;
                let mut max_abs = vec![0.0f32; n];
                for (idx, v) in full.data().iter().enumerate() {
                    max_abs[idx % n] = max_abs[idx % n].max(v.abs());
                }
                let scales: Vec<f32> = max_abs
                    .iter()
                    .map(|&m| if m > 0.0 { m / 127.0 } else { 1.0 })
                    .collect();
                let codes = full
                    .data()
                    .iter()
                    .enumerate()
                    .map(|(idx, &v)| (v / scales[idx % n]).round().clamp(-127.0, 127.0) as i8)
                    .collect();
                DenseWeights::Int8 { codes, scales }
            }
            other => return Err(LayerError::UnsupportedBitWidth { bits: other }),
        };
        Ok(Self {
            weights,
            bias: self.bias.clone(),
            in_features: self.in_features,
            out_features: self.out_features,
        })
    }

    fn affine<W>(&self, input: &Tensor, weight: W) -> Tensor
    where
        W: Fn(usize) -> f32,
    {
        let (m, k, n) = (input.rows(), self.in_features, self.out_features);
        let x = input.data();
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a = x[i * k + l];
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    out[i * n + j] += a * weight(l * n + j);
                }
            }
        }
        Tensor::from_data(&[m, n], out)
    }
}

impl Layer for Dense {
    fn forward(&self, input: &Tensor) -> Result<Tensor, LayerError> {
        if input.ndim() != 2 {
            return Err(LayerError::ShapeMismatch {
                expected: vec![input.rows(), self.in_features],
                actual: input.shape().to_vec(),
            });
        }
        if input.cols() != self.in_features {
            return Err(LayerError::InvalidInputDimension {
                expected: self.in_features,
                actual: input.cols(),
            });
        }

        let output = match &self.weights {
            DenseWeights::F32(w) => input.matmul(w),
            DenseWeights::F16(w) => self.affine(input, |idx| w[idx].to_f32()),
            DenseWeights::Int8 { codes, scales } => {
                let n = self.out_features;
                self.affine(input, |idx| codes[idx] as f32 * scales[idx % n])
            }
        };

        Ok(match &self.bias {
            Some(b) => output.add(b),
            None => output,
        })
    }
}
