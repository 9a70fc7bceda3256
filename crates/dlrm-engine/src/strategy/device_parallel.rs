use dlrm_embedding::{EmbeddingStore, SparseBatch};
use dlrm_layers::Tensor;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{check_batch, DenseModel, DlrmModel};
use crate::shard::{DeviceAssignment, ShardPlan};

/// Data parallelism for the encoders, model parallelism for the tables,
/// inside one process.
///
/// Each forward call uses `min(devices, batch_size, tables)` devices. Every
/// device holds a copy of the dense half and the tables `k` with
/// `k % devices == device`. The batch rows are split contiguously, each
/// device pools its tables over the whole batch, and the pooled rows are
/// then shuffled so every device sees all tables for its own rows.
///
/// Encoder copies are refreshed whenever the batch size or device count
/// changes, when the dense parameters were replaced, and on every call if
/// `sync_dense_params` is set.
#[derive(Debug, Clone)]
pub struct DeviceParallelStrategy {
    model: DlrmModel,
    devices: usize,
    sync_dense_params: bool,
    replicas: Vec<DenseModel>,
    shards: Vec<EmbeddingStore>,
    assignment: Option<DeviceAssignment>,
    replicated_batch: Option<usize>,
    dense_dirty: bool,
}

impl DeviceParallelStrategy {
    /// Spreads `model` over up to `devices` devices.
    pub fn new(model: DlrmModel, devices: usize, sync_dense_params: bool) -> Self {
        Self {
            model,
            devices: devices.max(1),
            sync_dense_params,
            replicas: Vec::new(),
            shards: Vec::new(),
            assignment: None,
            replicated_batch: None,
            dense_dirty: true,
        }
    }

    /// The master copy of the model.
    pub fn model(&self) -> &DlrmModel {
        &self.model
    }

    /// Devices used by the last call, 0 before the first.
    pub fn active_devices(&self) -> usize {
        self.replicas.len()
    }

    /// Current table placement, if any call has run.
    pub fn assignment(&self) -> Option<&DeviceAssignment> {
        self.assignment.as_ref()
    }

    /// Marks the encoder copies stale, so the next call re-replicates.
    pub fn mark_dense_dirty(&mut self) {
        self.dense_dirty = true;
    }

    /// Replaces the master encoders, e.g. after an external update step.
    ///
    /// The device copies are refreshed on the next call.
    pub fn replace_dense(&mut self, dense: DenseModel) {
        self.model.set_dense(dense);
        self.mark_dense_dirty();
    }

    fn effective_devices(&self, batch_size: usize) -> usize {
        self.devices
            .min(batch_size)
            .min(self.model.config().num_tables())
            .max(1)
    }

    /// Brings shards and encoder copies up to date for a batch of
    /// `batch_size` rows and returns the table placement to use.
    fn prepare(&mut self, batch_size: usize) -> DeviceAssignment {
        let n = self.effective_devices(batch_size);
        let assignment = match &self.assignment {
            Some(a) if a.devices() == n => a.clone(),
            _ => {
                let a = DeviceAssignment::round_robin(self.model.config().num_tables(), n);
                self.shards = self.model.store().round_robin(n);
                self.assignment = Some(a.clone());
                info!(devices = n, "Sharded embedding tables across devices");
                a
            }
        };
        let stale = self.dense_dirty
            || self.sync_dense_params
            || self.replicas.len() != n
            || self.replicated_batch != Some(batch_size);
        if stale {
            self.replicas = vec![self.model.dense().clone(); n];
            self.replicated_batch = Some(batch_size);
            self.dense_dirty = false;
            debug!(devices = n, batch_size, "Replicated dense encoders");
        }
        assignment
    }

    /// Scores one batch.
    pub fn forward(&mut self, dense: &Tensor, batch: &SparseBatch) -> Result<Tensor> {
        let tables = self.model.config().num_tables();
        check_batch(dense, batch, tables)?;
        let batch_size = dense.rows();
        let assignment = self.prepare(batch_size);
        let assignment = &assignment;
        let n = self.replicas.len();
        let rows = ShardPlan::contiguous(batch_size, n);
        debug!(devices = n, batch_size, "Device-parallel forward");

        // Scatter rows, encode them, and pool each device's tables over the
        // full batch. All devices finish before the shuffle reads anything.
        let engine = self.model.lookup_engine();
        let (bottom, pooled) = rayon::join(
            || {
                self.replicas
                    .par_iter()
                    .enumerate()
                    .map(|(d, replica)| {
                        let range = rows.range(d);
                        replica.encode_dense(&dense.slice_rows(range.start, range.end))
                    })
                    .collect::<Result<Vec<_>>>()
            },
            || {
                self.shards
                    .par_iter()
                    .enumerate()
                    .map(|(d, shard)| {
                        let local = batch.pick_tables(&assignment.tables_of(d));
                        Ok(engine.lookup(shard, &local)?)
                    })
                    .collect::<Result<Vec<_>>>()
            },
        );
        let bottom = bottom?;
        let pooled = pooled?;

        // Shuffle: device d takes rows `rows.range(d)` of every table, in
        // global table order.
        let scores = (0..n)
            .into_par_iter()
            .map(|d| {
                let range = rows.range(d);
                let local: Vec<Tensor> = (0..tables)
                    .map(|t| {
                        let owner = assignment.device_of(t);
                        pooled[owner][t / n].slice_rows(range.start, range.end)
                    })
                    .collect();
                self.replicas[d].score(&bottom[d], &local)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Tensor::concat_rows(&scores)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model(tables: usize) -> DlrmModel {
        let f = tables + 1;
        let cfg = ModelConfig::new(
            4,
            vec![6; tables],
            vec![3, 4],
            vec![4 + f * (f - 1) / 2, 3, 1],
        );
        DlrmModel::build(cfg).unwrap()
    }

    fn inputs(batch: usize, tables: usize) -> (Tensor, SparseBatch) {
        let dense = Tensor::from_data(
            &[batch, 3],
            (0..batch * 3).map(|i| (i as f32 * 0.37).sin()).collect(),
        );
        let sparse = SparseBatch::fixed(
            (0..tables)
                .map(|t| (0..batch * 2).map(|i| (i * 5 + t) % 6).collect())
                .collect(),
            2,
        )
        .unwrap();
        (dense, sparse)
    }

    #[test]
    fn test_matches_sequential() {
        let m = model(5);
        let (dense, sparse) = inputs(7, 5);
        let expected = m.forward(&dense, &sparse).unwrap();
        let mut dp = DeviceParallelStrategy::new(m, 3, false);
        let got = dp.forward(&dense, &sparse).unwrap();
        assert_eq!(dp.active_devices(), 3);
        assert!(got.max_abs_diff(&expected) < 1e-5);
    }

    #[test]
    fn test_effective_devices_follow_batch() {
        let m = model(4);
        let mut dp = DeviceParallelStrategy::new(m.clone(), 4, false);
        let (dense, sparse) = inputs(2, 4);
        let got = dp.forward(&dense, &sparse).unwrap();
        assert_eq!(dp.active_devices(), 2);
        assert!(got.max_abs_diff(&m.forward(&dense, &sparse).unwrap()) < 1e-5);

        let (dense, sparse) = inputs(8, 4);
        let got = dp.forward(&dense, &sparse).unwrap();
        assert_eq!(dp.active_devices(), 4);
        assert_eq!(dp.assignment().map(|a| a.tables_of(1)), Some(vec![1]));
        assert!(got.max_abs_diff(&m.forward(&dense, &sparse).unwrap()) < 1e-5);
    }

    #[test]
    fn test_replaced_encoders_reach_devices() {
        let m = model(3);
        let (dense, sparse) = inputs(4, 3);
        let mut dp = DeviceParallelStrategy::new(m.clone(), 2, false);
        dp.forward(&dense, &sparse).unwrap();

        let half = m.dense().quantize(16).unwrap();
        dp.replace_dense(half.clone());
        let got = dp.forward(&dense, &sparse).unwrap();
        let mut expected_model = m;
        expected_model.set_dense(half);
        let expected = expected_model.forward(&dense, &sparse).unwrap();
        assert!(got.max_abs_diff(&expected) < 1e-6);
    }

    #[test]
    fn test_rejects_bad_index() {
        let mut dp = DeviceParallelStrategy::new(model(2), 2, true);
        let dense = Tensor::zeros(&[2, 3]);
        let sparse = SparseBatch::fixed(vec![vec![0, 1], vec![6, 0]], 1).unwrap();
        assert!(dp.forward(&dense, &sparse).is_err());
    }
}
