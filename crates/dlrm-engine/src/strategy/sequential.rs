use dlrm_embedding::SparseBatch;
use dlrm_layers::Tensor;

use crate::error::Result;
use crate::model::DlrmModel;

/// Runs the whole pipeline on one device.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    model: DlrmModel,
}

impl SequentialStrategy {
    /// Wraps a full model.
    pub fn new(model: DlrmModel) -> Self {
        Self { model }
    }

    /// The model.
    pub fn model(&self) -> &DlrmModel {
        &self.model
    }

    /// Scores one batch.
    pub fn forward(&self, dense: &Tensor, batch: &SparseBatch) -> Result<Tensor> {
        self.model.forward(dense, batch)
    }
}
