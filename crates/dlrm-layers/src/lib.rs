//! Dense-side building blocks for DLRM inference.
//!
//! This crate provides the parts of the model that operate on dense
//! matrices:
//!
//! - **Tensor**: a row-major `[batch, width]` array with the slicing and
//!   concatenation needed to scatter and gather batch shards
//! - **Dense**: an affine transform whose kernel may be stored in f32, f16
//!   or int8
//! - **DenseEncoder**: the bottom and top feed-forward stacks
//! - **Interaction**: the `dot` and `cat` feature interactions
//! - **Initializers**: seeded, injectable weight initialization
//!
//! # Quick Start
//!
//! ```
//! use dlrm_layers::prelude::*;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut rng = StdRng::seed_from_u64(123);
//! let bottom = EncoderConfig::new(vec![4, 8, 4])
//!     .build(&VarianceScaledNormal, &mut rng)
//!     .unwrap();
//! let interaction = Interaction::new(InteractionOp::Dot, false, 2, 4);
//!
//! let dense = bottom.forward(&Tensor::ones(&[2, 4])).unwrap();
//! let pooled = vec![Tensor::ones(&[2, 4]), Tensor::zeros(&[2, 4])];
//! let z = interaction.forward(&dense, &pooled).unwrap();
//! assert_eq!(z.shape(), &[2, interaction.output_width()]);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod activation;
pub mod dense;
pub mod encoder;
pub mod error;
pub mod initializer;
pub mod interaction;
pub mod layer;
pub mod tensor;

// Re-export main types at crate level
pub use activation::ActivationType;
pub use dense::{Dense, DenseWeights};
pub use encoder::{DenseEncoder, EncoderConfig};
pub use error::{LayerError, LayerResult};
pub use initializer::{ConstantWeights, Initializer, VarianceScaledNormal, WeightInit};
pub use interaction::{interaction_width, Interaction, InteractionOp};
pub use layer::Layer;
pub use tensor::Tensor;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```
/// use dlrm_layers::prelude::*;
/// ```
pub mod prelude {
    pub use crate::activation::ActivationType;
    pub use crate::dense::Dense;
    pub use crate::encoder::{DenseEncoder, EncoderConfig};
    pub use crate::error::{LayerError, LayerResult};
    pub use crate::initializer::{VarianceScaledNormal, WeightInit};
    pub use crate::interaction::{Interaction, InteractionOp};
    pub use crate::layer::Layer;
    pub use crate::tensor::Tensor;
}
