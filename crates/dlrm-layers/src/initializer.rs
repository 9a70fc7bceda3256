//! Weight initialization for the dense transforms.
//!
//! All randomness flows through an explicit [`StdRng`] seeded by the caller,
//! so two builds from the same seed hold bit-identical weights.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Elementary fill strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    /// All zeros.
    Zeros,
    /// Constant value.
    Constant(f32),
    /// Normal distribution with the given standard deviation.
    Normal {
        /// Mean of the distribution.
        mean: f32,
        /// Standard deviation of the distribution.
        std: f32,
    },
    /// Uniform distribution over `[low, high)`.
    Uniform {
        /// Lower bound.
        low: f32,
        /// Upper bound.
        high: f32,
    },
}

impl Initializer {
    /// Fills a tensor of the given shape, drawing from `rng` if needed.
    pub fn initialize(&self, shape: &[usize], rng: &mut StdRng) -> Tensor {
        let n: usize = shape.iter().product();
        match *self {
            Initializer::Zeros => Tensor::zeros(shape),
            Initializer::Constant(value) => Tensor::from_data(shape, vec![value; n]),
            Initializer::Normal { mean, std } => {
                // std is always finite and non-negative here; fall back to the mean otherwise.
                match Normal::new(mean, std) {
                    Ok(normal) => {
                        Tensor::from_data(shape, (0..n).map(|_| normal.sample(rng)).collect())
                    }
                    Err(_) => Tensor::from_data(shape, vec![mean; n]),
                }
            }
            Initializer::Uniform { low, high } => {
                if high > low {
                    Tensor::from_data(shape, (0..n).map(|_| rng.gen_range(low..high)).collect())
                } else {
                    Tensor::from_data(shape, vec![low; n])
                }
            }
        }
    }
}

/// Strategy producing the kernel and bias of one affine transform.
///
/// Encoders take this as a trait object so tests and benchmarks can inject
/// deterministic constant weights.
pub trait WeightInit: Send + Sync {
    /// Kernel of shape `[fan_in, fan_out]`.
    fn kernel(&self, fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Tensor;

    /// Bias of shape `[fan_out]`.
    fn bias(&self, fan_out: usize, rng: &mut StdRng) -> Tensor;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Variance-scaled normal: `std = sqrt(2 / (fan_in + fan_out))` for the
/// kernel and `sqrt(1 / fan_out)` for the bias.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarianceScaledNormal;

impl WeightInit for VarianceScaledNormal {
    fn kernel(&self, fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Tensor {
        let std = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
        Initializer::Normal { mean: 0.0, std }.initialize(&[fan_in, fan_out], rng)
    }

    fn bias(&self, fan_out: usize, rng: &mut StdRng) -> Tensor {
        let std = (1.0 / fan_out.max(1) as f32).sqrt();
        Initializer::Normal { mean: 0.0, std }.initialize(&[fan_out], rng)
    }

    fn name(&self) -> &str {
        "variance_scaled_normal"
    }
}

/// Fills kernels and biases with fixed values.
#[derive(Debug, Clone, Copy)]
pub struct ConstantWeights {
    /// Kernel value.
    pub kernel: f32,
    /// Bias value.
    pub bias: f32,
}

impl WeightInit for ConstantWeights {
    fn kernel(&self, fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Tensor {
        Initializer::Constant(self.kernel).initialize(&[fan_in, fan_out], rng)
    }

    fn bias(&self, fan_out: usize, rng: &mut StdRng) -> Tensor {
        Initializer::Constant(self.bias).initialize(&[fan_out], rng)
    }

    fn name(&self) -> &str {
        "constant"
    }
}
