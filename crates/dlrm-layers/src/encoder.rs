//! Feed-forward encoder stacks.
//!
//! This module provides [`DenseEncoder`], a static list of
//! `(affine transform, nonlinearity)` pairs built from a width list
//! `[n0, n1, ..., nk]`. The bottom and top stacks of the model are both
//! encoders; they differ only in widths and in which layer (if any) ends in
//! a sigmoid.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::ActivationType;
use crate::dense::Dense;
use crate::error::{LayerError, LayerResult};
use crate::initializer::WeightInit;
use crate::layer::Layer;
use crate::tensor::Tensor;

/// Configuration for building a [`DenseEncoder`].
///
/// # Example
///
/// ```
/// use dlrm_layers::encoder::EncoderConfig;
///
/// let config = EncoderConfig::new(vec![13, 512, 256, 64]);
/// assert_eq!(config.num_layers(), 3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Layer widths; layer `i` maps `widths[i]` to `widths[i + 1]`
    pub widths: Vec<usize>,
    /// Index of the layer that ends in a sigmoid instead of a rectifier
    pub sigmoid_layer: Option<usize>,
}

impl EncoderConfig {
    /// Creates a rectifier-only configuration from a width list.
    pub fn new(widths: Vec<usize>) -> Self {
        Self {
            widths,
            sigmoid_layer: None,
        }
    }

    /// Designates the layer at `index` as the sigmoid layer.
    pub fn with_sigmoid_layer(mut self, index: usize) -> Self {
        self.sigmoid_layer = Some(index);
        self
    }

    /// Designates the final layer as the sigmoid layer.
    pub fn with_sigmoid_last(self) -> Self {
        let last = self.num_layers().saturating_sub(1);
        self.with_sigmoid_layer(last)
    }

    /// Number of affine transforms.
    pub fn num_layers(&self) -> usize {
        self.widths.len().saturating_sub(1)
    }

    /// Activation of layer `index`.
    pub fn activation(&self, index: usize) -> ActivationType {
        if self.sigmoid_layer == Some(index) {
            ActivationType::Sigmoid
        } else {
            ActivationType::ReLU
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LayerResult<()> {
        if self.widths.len() < 2 {
            return Err(LayerError::ConfigError {
                message: format!(
                    "Encoder needs at least an input and an output width, got {:?}",
                    self.widths
                ),
            });
        }
        if let Some(i) = self.widths.iter().position(|&w| w == 0) {
            return Err(LayerError::ConfigError {
                message: format!("Encoder width {} is zero", i),
            });
        }
        if let Some(idx) = self.sigmoid_layer {
            if idx >= self.num_layers() {
                return Err(LayerError::ConfigError {
                    message: format!(
                        "Sigmoid layer {} out of range for {} layers",
                        idx,
                        self.num_layers()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Builds the encoder, drawing weights from `rng` layer by layer.
    pub fn build(self, init: &dyn WeightInit, rng: &mut StdRng) -> LayerResult<DenseEncoder> {
        DenseEncoder::from_config(self, init, rng)
    }
}

/// A stack of dense transforms each followed by its nonlinearity.
///
/// # Example
///
/// ```
/// use dlrm_layers::encoder::EncoderConfig;
/// use dlrm_layers::initializer::VarianceScaledNormal;
/// use dlrm_layers::layer::Layer;
/// use dlrm_layers::tensor::Tensor;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let mut rng = StdRng::seed_from_u64(0);
/// let top = EncoderConfig::new(vec![8, 4, 1])
///     .with_sigmoid_last()
///     .build(&VarianceScaledNormal, &mut rng)
///     .unwrap();
/// let scores = top.forward(&Tensor::ones(&[2, 8])).unwrap();
/// assert_eq!(scores.shape(), &[2, 1]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseEncoder {
    /// Ordered (transform, nonlinearity) pairs
    layers: Vec<(Dense, ActivationType)>,
    /// Configuration used to build this encoder
    config: EncoderConfig,
}

impl DenseEncoder {
    /// Creates an encoder from a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid
    pub fn from_config(
        config: EncoderConfig,
        init: &dyn WeightInit,
        rng: &mut StdRng,
    ) -> LayerResult<Self> {
        config.validate()?;
        let layers = config
            .widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let dense = Dense::new_with_initializer(pair[0], pair[1], init, true, rng);
                (dense, config.activation(i))
            })
            .collect();
        Ok(Self { layers, config })
    }

    /// Creates an encoder from prebuilt layers.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ConfigError`] if consecutive widths don't chain.
    pub fn from_layers(layers: Vec<(Dense, ActivationType)>) -> LayerResult<Self> {
        let mut widths = Vec::with_capacity(layers.len() + 1);
        let mut sigmoid_layer = None;
        for (i, (dense, act)) in layers.iter().enumerate() {
            match widths.last() {
                None => widths.push(dense.in_features()),
                Some(&prev) if prev != dense.in_features() => {
                    return Err(LayerError::ConfigError {
                        message: format!(
                            "Layer {} expects width {} but the previous layer produces {}",
                            i,
                            dense.in_features(),
                            prev
                        ),
                    });
                }
                Some(_) => {}
            }
            widths.push(dense.out_features());
            if *act == ActivationType::Sigmoid {
                sigmoid_layer = Some(i);
            }
        }
        let config = EncoderConfig {
            widths,
            sigmoid_layer,
        };
        config.validate()?;
        Ok(Self { layers, config })
    }

    /// Returns the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Returns the (transform, nonlinearity) pairs.
    pub fn layers(&self) -> &[(Dense, ActivationType)] {
        &self.layers
    }

    /// Returns the configuration used to build this encoder.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Returns the input dimension.
    pub fn input_dim(&self) -> usize {
        self.config.widths[0]
    }

    /// Returns the output dimension.
    pub fn output_dim(&self) -> usize {
        self.config.widths.last().copied().unwrap_or(0)
    }

    /// Kernel bit width per layer.
    pub fn bit_widths(&self) -> Vec<u32> {
        self.layers.iter().map(|(d, _)| d.bits()).collect()
    }

    /// Returns a copy with every kernel stored at `bits` precision.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::UnsupportedBitWidth`] unless `bits` is 8, 16 or 32.
    pub fn quantize(&self, bits: u32) -> LayerResult<DenseEncoder> {
        let layers = self
            .layers
            .iter()
            .map(|(dense, act)| Ok((dense.quantize(bits)?, *act)))
            .collect::<LayerResult<Vec<_>>>()?;
        debug!(bits, layers = layers.len(), "quantized encoder weights");
        Ok(Self {
            layers,
            config: self.config.clone(),
        })
    }
}

impl Layer for DenseEncoder {
    fn forward(&self, input: &Tensor) -> Result<Tensor, LayerError> {
        let mut x = input.clone();
        for (dense, activation) in &self.layers {
            x = activation.apply(&dense.forward(&x)?);
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::{ConstantWeights, VarianceScaledNormal};
    use rand::SeedableRng;

    #[test]
    fn test_encoder_config_invalid() {
        assert!(EncoderConfig::new(vec![4]).validate().is_err());
        assert!(EncoderConfig::new(vec![4, 0, 2]).validate().is_err());
        assert!(EncoderConfig::new(vec![4, 2])
            .with_sigmoid_layer(1)
            .validate()
            .is_err());
        assert!(EncoderConfig::new(vec![4, 3, 2])
            .with_sigmoid_last()
            .validate()
            .is_ok());
    }

    #[test]
    fn test_activation_dispatch() {
        let config = EncoderConfig::new(vec![4, 3, 2, 1]).with_sigmoid_layer(2);
        assert_eq!(config.activation(0), ActivationType::ReLU);
        assert_eq!(config.activation(1), ActivationType::ReLU);
        assert_eq!(config.activation(2), ActivationType::Sigmoid);
    }

    #[test]
    fn test_encoder_forward_constant_weights() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = ConstantWeights {
            kernel: 0.5,
            bias: 0.0,
        };
        let enc = EncoderConfig::new(vec![2, 2, 1])
            .with_sigmoid_last()
            .build(&init, &mut rng)
            .unwrap();
        let x = Tensor::from_data(&[1, 2], vec![1.0, 1.0]);
        // hidden = relu([1, 1]); out = sigmoid(1.0)
        let y = enc.forward(&x).unwrap();
        let expected = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((y.data()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_encoder_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let enc = EncoderConfig::new(vec![10, 5, 2])
            .build(&VarianceScaledNormal, &mut rng)
            .unwrap();
        assert_eq!(enc.num_layers(), 2);
        assert_eq!(enc.input_dim(), 10);
        assert_eq!(enc.output_dim(), 2);
        assert_eq!(enc.forward(&Tensor::ones(&[3, 10])).unwrap().shape(), &[3, 2]);
    }

    #[test]
    fn test_encoder_quantize() {
        let mut rng = StdRng::seed_from_u64(2);
        let enc = EncoderConfig::new(vec![6, 4, 1])
            .with_sigmoid_last()
            .build(&VarianceScaledNormal, &mut rng)
            .unwrap();
        let q = enc.quantize(16).unwrap();
        assert_eq!(q.bit_widths(), vec![16, 16]);
        assert!(enc.quantize(4).is_err());
        let x = Tensor::ones(&[2, 6]);
        let diff = q.forward(&x).unwrap().max_abs_diff(&enc.forward(&x).unwrap());
        assert!(diff < 1e-2);
    }

    #[test]
    fn test_from_layers_checks_chain() {
        let ok = DenseEncoder::from_layers(vec![
            (Dense::zeros(3, 2, true), ActivationType::ReLU),
            (Dense::zeros(2, 1, true), ActivationType::Sigmoid),
        ])
        .unwrap();
        assert_eq!(ok.config().sigmoid_layer, Some(1));

        let bad = DenseEncoder::from_layers(vec![
            (Dense::zeros(3, 2, true), ActivationType::ReLU),
            (Dense::zeros(4, 1, true), ActivationType::ReLU),
        ]);
        assert!(bad.is_err());
    }
}
