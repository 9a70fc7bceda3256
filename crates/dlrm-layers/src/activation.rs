//! Nonlinearities applied after each affine transform.

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Activation function types supported by the encoder stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivationType {
    /// Rectified Linear Unit
    #[default]
    ReLU,
    /// Sigmoid function
    Sigmoid,
}

impl ActivationType {
    /// Applies the nonlinearity element-wise.
    ///
    /// ```
    /// use dlrm_layers::activation::ActivationType;
    /// use dlrm_layers::tensor::Tensor;
    ///
    /// let input = Tensor::from_data(&[2, 2], vec![-1.0, 0.0, 1.0, 2.0]);
    /// let output = ActivationType::ReLU.apply(&input);
    /// assert_eq!(output.data(), &[0.0, 0.0, 1.0, 2.0]);
    /// ```
    pub fn apply(&self, input: &Tensor) -> Tensor {
        match self {
            Self::ReLU => input.map(|x| x.max(0.0)),
            Self::Sigmoid => input.map(sigmoid),
        }
    }

    /// Short lowercase name used in logs and shape contracts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReLU => "relu",
            Self::Sigmoid => "sigmoid",
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    // Split on sign so exp never overflows.
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_bounds() {
        let input = Tensor::from_data(&[1, 5], vec![-1000.0, -1.0, 0.0, 1.0, 1000.0]);
        let out = ActivationType::Sigmoid.apply(&input);
        assert!(out.data().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!((out.data()[2] - 0.5).abs() < 1e-6);
        assert!((out.data()[1] + out.data()[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_default_is_relu() {
        assert_eq!(ActivationType::default(), ActivationType::ReLU);
        assert_eq!(ActivationType::Sigmoid.as_str(), "sigmoid");
    }
}
