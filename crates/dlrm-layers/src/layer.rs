//! The forward-only [`Layer`] trait shared by the MLP pieces.

use crate::error::LayerError;
use crate::tensor::Tensor;

/// Maps a `[batch, in]` tensor to a `[batch, out]` tensor.
///
/// Implemented by [`Dense`](crate::dense::Dense) and
/// [`DenseEncoder`](crate::encoder::DenseEncoder). Forward takes `&self`, so a
/// replica can serve several threads at once; quantizing builds a new value.
///
/// ```
/// use dlrm_layers::dense::Dense;
/// use dlrm_layers::layer::Layer;
/// use dlrm_layers::tensor::Tensor;
///
/// let layer = Dense::zeros(13, 4, true);
/// let out = layer.forward(&Tensor::zeros(&[8, 13])).unwrap();
/// assert_eq!(out.shape(), &[8, 4]);
/// ```
pub trait Layer: Send + Sync {
    /// Runs the layer on one batch.
    ///
    /// # Errors
    ///
    /// Fails when the input width does not match the layer.
    fn forward(&self, input: &Tensor) -> Result<Tensor, LayerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Dense;

    fn run(layer: &dyn Layer, input: &Tensor) -> Result<Tensor, LayerError> {
        layer.forward(input)
    }

    #[test]
    fn test_forward_through_trait_object() {
        let w = Tensor::from_data(&[2, 1], vec![1.0, -1.0]);
        let layer = Dense::from_weights(w, None).unwrap();
        let y = run(&layer, &Tensor::from_data(&[2, 2], vec![3.0, 1.0, 0.5, 2.0])).unwrap();
        assert_eq!(y.shape(), &[2, 1]);
        assert_eq!(y.data(), &[2.0, -1.5]);
        assert!(run(&layer, &Tensor::zeros(&[2, 3])).is_err());
    }
}
