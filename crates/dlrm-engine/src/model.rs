//! DLRM model assembly and the single-device forward pass.
//!
//! A [`DlrmModel`] is split into the part that is replicated across
//! devices ([`DenseModel`]: bottom encoder, interaction, top encoder) and
//! the part that is sharded ([`EmbeddingStore`]). The execution strategies
//! in [`crate::strategy`] move these two halves around; the forward math
//! lives here.
//!
//! # Seeding
//!
//! A master [`StdRng`] seeded from [`ModelConfig::seed`] first draws one
//! seed per table for all tables, then one seed each for the bottom
//! encoder, the top encoder and the interaction projection. Every shard
//! draws the full sequence, so a table or encoder comes out identical
//! whichever rank builds it.

use std::ops::Range;

use dlrm_embedding::{
    table_seeds, BatchedLookupEngine, EmbeddingBag, EmbeddingStore, Encoding, MdBag, QrBag,
    SparseBatch, StoreEntry, TableInitializer, UniformTableInit,
};
use dlrm_layers::{
    DenseEncoder, EncoderConfig, Interaction, InteractionOp, Layer, Tensor, VarianceScaledNormal,
    WeightInit,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ModelConfig, TableSpec};
use crate::error::{EngineError, Result};
use crate::shard::ShardPlan;

/// Bottom encoder, interaction and top encoder.
///
/// This is the part of the model that device-parallel execution copies to
/// every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseModel {
    bottom: DenseEncoder,
    interaction: Interaction,
    top: DenseEncoder,
    loss_threshold: f32,
}

impl DenseModel {
    /// Assembles the dense half from prebuilt parts.
    pub fn new(
        bottom: DenseEncoder,
        interaction: Interaction,
        top: DenseEncoder,
        loss_threshold: f32,
    ) -> Self {
        Self {
            bottom,
            interaction,
            top,
            loss_threshold,
        }
    }

    /// Bottom encoder.
    pub fn bottom(&self) -> &DenseEncoder {
        &self.bottom
    }

    /// Top encoder.
    pub fn top(&self) -> &DenseEncoder {
        &self.top
    }

    /// Feature interaction.
    pub fn interaction(&self) -> &Interaction {
        &self.interaction
    }

    /// Dense feature count expected per row.
    pub fn dense_features(&self) -> usize {
        self.bottom.input_dim()
    }

    /// Runs the bottom encoder over `[rows, dense_features]` input.
    pub fn encode_dense(&self, dense: &Tensor) -> Result<Tensor> {
        if dense.ndim() != 2 || dense.cols() != self.dense_features() {
            return Err(EngineError::CorruptedInput {
                message: format!(
                    "dense batch has shape {:?}, expected [batch, {}]",
                    dense.shape(),
                    self.dense_features()
                ),
            });
        }
        Ok(self.bottom.forward(dense)?)
    }

    /// Interacts the bottom output with the pooled vectors and scores it.
    ///
    /// Returns a `[rows, 1]` score tensor, clamped into `(t, 1 - t)` when
    /// the loss threshold `t` is strictly between 0 and 1.
    pub fn score(&self, bottom_out: &Tensor, pooled: &[Tensor]) -> Result<Tensor> {
        let z = self.interaction.forward(bottom_out, pooled)?;
        let p = self.top.forward(&z)?;
        if self.loss_threshold > 0.0 && self.loss_threshold < 1.0 {
            Ok(p.clamp(self.loss_threshold, 1.0 - self.loss_threshold))
        } else {
            Ok(p)
        }
    }

    /// Returns a copy with encoder kernels stored at `bits` precision.
    pub fn quantize(&self, bits: u32) -> Result<DenseModel> {
        if !matches!(bits, 8 | 16 | 32) {
            return Err(EngineError::UnsupportedBitWidth {
                target: "mlp",
                bits,
            });
        }
        Ok(Self {
            bottom: self.bottom.quantize(bits)?,
            interaction: self.interaction.clone(),
            top: self.top.quantize(bits)?,
            loss_threshold: self.loss_threshold,
        })
    }
}

/// A built model, or the shard of one owned by a single rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlrmModel {
    config: ModelConfig,
    dense: DenseModel,
    store: EmbeddingStore,
    shard: Option<(usize, ShardPlan)>,
    #[serde(skip, default)]
    lookup: LookupMode,
}

/// Which lookup path a model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LookupMode {
    #[default]
    Merged,
    PerTable,
}

impl LookupMode {
    fn engine(self) -> BatchedLookupEngine {
        match self {
            Self::Merged => BatchedLookupEngine::new(),
            Self::PerTable => BatchedLookupEngine::per_table(),
        }
    }
}

impl DlrmModel {
    /// Builds the full model with the default initializers.
    pub fn build(config: ModelConfig) -> Result<Self> {
        Self::build_with(config, &UniformTableInit, &VarianceScaledNormal)
    }

    /// Builds the full model with injected initializers.
    pub fn build_with(
        config: ModelConfig,
        table_init: &dyn TableInitializer,
        weight_init: &dyn WeightInit,
    ) -> Result<Self> {
        let tables = 0..config.num_tables();
        Self::assemble(config, tables, None, table_init, weight_init)
    }

    /// Builds the shard owned by `rank` out of `ranks`: the full dense half
    /// and the contiguous table range assigned by [`ShardPlan::contiguous`].
    pub fn build_shard(
        config: ModelConfig,
        rank: usize,
        ranks: usize,
        table_init: &dyn TableInitializer,
        weight_init: &dyn WeightInit,
    ) -> Result<Self> {
        if rank >= ranks {
            return Err(EngineError::InvalidConfig {
                message: format!("rank {rank} out of range for {ranks} ranks"),
            });
        }
        let plan = ShardPlan::contiguous(config.num_tables(), ranks);
        let tables = plan.range(rank);
        Self::assemble(config, tables, Some((rank, plan)), table_init, weight_init)
    }

    fn assemble(
        config: ModelConfig,
        tables: Range<usize>,
        shard: Option<(usize, ShardPlan)>,
        table_init: &dyn TableInitializer,
        weight_init: &dyn WeightInit,
    ) -> Result<Self> {
        let num_int = config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let seeds = table_seeds(&mut rng, config.num_tables());
        let bottom_seed: u64 = rng.gen();
        let top_seed: u64 = rng.gen();
        let projection_seed: u64 = rng.gen();

        let specs = config.table_specs();
        let entries = tables
            .clone()
            .map(|t| {
                Ok(StoreEntry {
                    global_index: t,
                    bag: build_bag(&specs[t], table_init, seeds[t])?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut store = EmbeddingStore::from_entries(entries);
        if config.embedding_bits != 32 {
            store = store.quantize(config.embedding_bits)?;
        }

        let bottom = build_encoder(config.bottom_config(), weight_init, bottom_seed)?;
        let top = build_encoder(config.top_config(), weight_init, top_seed)?;
        let mut interaction = Interaction::new(
            config.interaction_op,
            config.self_interaction,
            config.num_tables(),
            config.bottom_output(),
        );
        if config.projection_size > 0 {
            let mut proj_rng = StdRng::seed_from_u64(projection_seed);
            interaction =
                interaction.with_projection(config.projection_size, weight_init, &mut proj_rng)?;
        }
        let mut dense = DenseModel::new(bottom, interaction, top, config.loss_threshold);
        if config.mlp_bits != 32 {
            dense = dense.quantize(config.mlp_bits)?;
        }

        info!(
            tables = store.len(),
            total_tables = config.num_tables(),
            first_table = tables.start,
            interactions = num_int,
            embedding_bits = config.embedding_bits,
            mlp_bits = config.mlp_bits,
            embedding_bytes = store.byte_size(),
            "Built DLRM model"
        );
        Ok(Self {
            config,
            dense,
            store,
            shard,
            lookup: LookupMode::Merged,
        })
    }

    /// Assembles a model from prebuilt halves.
    ///
    /// The store must hold every table of `config`, in order.
    pub fn from_parts(config: ModelConfig, dense: DenseModel, store: EmbeddingStore) -> Result<Self> {
        config.validate()?;
        if store.len() != config.num_tables() {
            return Err(EngineError::DimensionMismatch {
                what: "tables in store".into(),
                expected: config.num_tables(),
                actual: store.len(),
            });
        }
        Ok(Self {
            config,
            dense,
            store,
            shard: None,
            lookup: LookupMode::Merged,
        })
    }

    /// Forces the per-table lookup path.
    pub fn with_per_table_lookup(mut self) -> Self {
        self.lookup = LookupMode::PerTable;
        self
    }

    /// Configuration the model was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The replicated half.
    pub fn dense(&self) -> &DenseModel {
        &self.dense
    }

    /// Swaps in new encoders of the same shape.
    pub(crate) fn set_dense(&mut self, dense: DenseModel) {
        self.dense = dense;
    }

    /// The tables this model holds.
    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Rank and plan if this is a shard.
    pub fn shard(&self) -> Option<(usize, &ShardPlan)> {
        self.shard.as_ref().map(|(r, p)| (*r, p))
    }

    /// Lookup engine matching this model's lookup mode.
    pub fn lookup_engine(&self) -> BatchedLookupEngine {
        self.lookup.engine()
    }

    /// Pools `batch` against this model's tables.
    pub fn lookup(&self, batch: &SparseBatch) -> Result<Vec<Tensor>> {
        Ok(self.lookup.engine().lookup(&self.store, batch)?)
    }

    /// Scores one batch on a single device.
    ///
    /// # Errors
    ///
    /// Fails with an input-corruption error if the dense and sparse inputs
    /// disagree on the batch size or any index is out of range.
    pub fn forward(&self, dense: &Tensor, batch: &SparseBatch) -> Result<Tensor> {
        check_batch(dense, batch, self.config.num_tables())?;
        debug!(batch_size = dense.rows(), "Sequential forward");
        let pooled = self.lookup(batch)?;
        let x = self.dense.encode_dense(dense)?;
        self.dense.score(&x, &pooled)
    }

    /// Returns a copy whose tables are quantized to `bits` (4, 8 or 32).
    ///
    /// The receiver keeps its full-precision tables.
    pub fn quantize_embeddings(&self, bits: u32) -> Result<DlrmModel> {
        if !matches!(bits, 4 | 8 | 32) {
            return Err(EngineError::UnsupportedBitWidth {
                target: "embedding",
                bits,
            });
        }
        if bits != 32 {
            if self.config.qr.is_some() {
                return Err(EngineError::IncompatibleQuantization {
                    bits,
                    trick: "quotient-remainder",
                });
            }
            if self.config.md.is_some() {
                return Err(EngineError::IncompatibleQuantization {
                    bits,
                    trick: "mixed-dimension",
                });
            }
        }
        let mut model = self.clone();
        model.store = self.store.quantize(bits)?;
        model.config.embedding_bits = bits;
        Ok(model)
    }

    /// Returns a copy whose encoder kernels are stored at `bits` (8, 16 or 32).
    pub fn quantize_dense(&self, bits: u32) -> Result<DlrmModel> {
        let mut model = self.clone();
        model.dense = self.dense.quantize(bits)?;
        model.config.mlp_bits = bits;
        info!(bits, "Quantized dense encoders");
        Ok(model)
    }

    /// Describes every table and encoder held by this model.
    pub fn shape_contract(&self) -> ShapeContract {
        let tables = self
            .store
            .entries()
            .iter()
            .map(|e| TableContract {
                global_index: e.global_index,
                kind: e.bag.kind().to_string(),
                rows: e.bag.rows(),
                storage_width: e.bag.storage_width(),
                output_width: e.bag.output_width(),
                encoding: e.bag.encoding(),
                byte_size: e.bag.byte_size(),
                owner: self
                    .shard
                    .as_ref()
                    .and_then(|(_, plan)| plan.owner(e.global_index)),
            })
            .collect();
        ShapeContract {
            num_tables: self.config.num_tables(),
            tables,
            bottom: EncoderContract::of(self.dense.bottom()),
            interaction: InteractionContract {
                op: self.dense.interaction().op(),
                self_interaction: self.dense.interaction().self_interaction(),
                projection_size: self.dense.interaction().projection_size(),
                output_width: self.dense.interaction().output_width(),
            },
            top: EncoderContract::of(self.dense.top()),
            rank: self.shard.as_ref().map(|(r, _)| *r),
            shard_plan: self.shard.as_ref().map(|(_, p)| p.clone()),
        }
    }
}

fn build_bag(spec: &TableSpec, init: &dyn TableInitializer, seed: u64) -> Result<EmbeddingBag> {
    Ok(match *spec {
        TableSpec::Plain { rows, dim } => EmbeddingBag::Plain(init.init_table(rows, dim, seed)),
        TableSpec::QuotientRemainder {
            rows,
            dim,
            collisions,
            operation,
        } => EmbeddingBag::QuotientRemainder(QrBag::new(
            rows, dim, collisions, operation, init, seed,
        )?),
        TableSpec::MixedDim {
            rows,
            dim,
            base_dim,
        } => EmbeddingBag::MixedDim(MdBag::new(rows, dim, base_dim, init, seed)?),
    })
}

fn build_encoder(config: EncoderConfig, init: &dyn WeightInit, seed: u64) -> Result<DenseEncoder> {
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(config.build(init, &mut rng)?)
}

/// Checks that the dense rows and every table's batch size agree.
pub(crate) fn check_batch(dense: &Tensor, batch: &SparseBatch, tables: usize) -> Result<()> {
    if batch.num_tables() != tables {
        return Err(dlrm_embedding::EmbeddingError::TableCountMismatch {
            tables,
            indices: batch.num_tables(),
            offsets: batch.num_tables(),
        }
        .into());
    }
    if tables > 0 && batch.batch_size() != dense.rows() {
        return Err(EngineError::CorruptedInput {
            message: format!(
                "dense batch has {} rows but sparse batch has {}",
                dense.rows(),
                batch.batch_size()
            ),
        });
    }
    Ok(())
}

/// Serializable description of a model's tables and encoders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeContract {
    /// Tables in the full model.
    pub num_tables: usize,
    /// Tables held by this model or shard.
    pub tables: Vec<TableContract>,
    /// Bottom encoder.
    pub bottom: EncoderContract,
    /// Interaction.
    pub interaction: InteractionContract,
    /// Top encoder.
    pub top: EncoderContract,
    /// Rank of this shard.
    pub rank: Option<usize>,
    /// Table split across ranks.
    pub shard_plan: Option<ShardPlan>,
}

/// Shape of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableContract {
    /// Position in the full model.
    pub global_index: usize,
    /// `plain`, `quotient-remainder` or `mixed-dimension`.
    pub kind: String,
    /// Logical rows.
    pub rows: usize,
    /// Stored width.
    pub storage_width: usize,
    /// Pooled width.
    pub output_width: usize,
    /// Storage encoding.
    pub encoding: Encoding,
    /// Weight bytes.
    pub byte_size: usize,
    /// Owning rank or device, when sharded.
    pub owner: Option<usize>,
}

/// Shape of one encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderContract {
    /// Layer widths.
    pub widths: Vec<usize>,
    /// Kernel bit width per layer.
    pub bits: Vec<u32>,
    /// Layer ending in a sigmoid.
    pub sigmoid_layer: Option<usize>,
}

impl EncoderContract {
    fn of(encoder: &DenseEncoder) -> Self {
        Self {
            widths: encoder.config().widths.clone(),
            bits: encoder.bit_widths(),
            sigmoid_layer: encoder.config().sigmoid_layer,
        }
    }
}

/// Shape of the interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionContract {
    /// Operator.
    pub op: InteractionOp,
    /// Whether the Gram diagonal is kept.
    pub self_interaction: bool,
    /// Projected feature width, 0 when disabled.
    pub projection_size: usize,
    /// Output width.
    pub output_width: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QrConfig;
    use crate::error::ErrorKind;
    use dlrm_embedding::QrOperation;

    fn config() -> ModelConfig {
        ModelConfig::new(4, vec![5, 5], vec![4, 8, 4], vec![7, 8, 1])
    }

    fn batch() -> (Tensor, SparseBatch) {
        let dense = Tensor::from_data(&[2, 4], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);
        let sparse =
            SparseBatch::fixed(vec![vec![0, 1, 2, 3], vec![4, 0, 1, 2]], 2).unwrap();
        (dense, sparse)
    }

    #[test]
    fn test_forward_scores_in_unit_interval() {
        let model = DlrmModel::build(config()).unwrap();
        let (dense, sparse) = batch();
        let scores = model.forward(&dense, &sparse).unwrap();
        assert_eq!(scores.shape(), &[2, 1]);
        assert!(scores.data().iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = DlrmModel::build(config()).unwrap();
        let b = DlrmModel::build(config()).unwrap();
        assert_eq!(a, b);
        let mut other = config();
        other.seed = 7;
        assert_ne!(a.store(), DlrmModel::build(other).unwrap().store());
    }

    #[test]
    fn test_shards_match_full_model() {
        let full = DlrmModel::build(ModelConfig::new(
            4,
            vec![5, 6, 7],
            vec![4, 4],
            vec![10, 1],
        ))
        .unwrap();
        for rank in 0..2 {
            let shard = DlrmModel::build_shard(
                full.config().clone(),
                rank,
                2,
                &UniformTableInit,
                &VarianceScaledNormal,
            )
            .unwrap();
            assert_eq!(shard.dense(), full.dense());
            for entry in shard.store().entries() {
                assert_eq!(Some(&entry.bag), full.store().bag(entry.global_index));
            }
        }
    }

    #[test]
    fn test_clamp_with_loss_threshold() {
        let mut cfg = config();
        cfg.loss_threshold = 0.4;
        let model = DlrmModel::build(cfg).unwrap();
        let (dense, sparse) = batch();
        let scores = model.forward(&dense, &sparse).unwrap();
        assert!(scores.data().iter().all(|&p| (0.4..=0.6).contains(&p)));
    }

    #[test]
    fn test_batch_size_disagreement() {
        let model = DlrmModel::build(config()).unwrap();
        let (_, sparse) = batch();
        let err = model.forward(&Tensor::zeros(&[3, 4]), &sparse).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputCorruption);
        let err = model.forward(&Tensor::zeros(&[2, 5]), &sparse).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputCorruption);
    }

    #[test]
    fn test_quantized_models_stay_close() {
        let model = DlrmModel::build(config()).unwrap();
        let (dense, sparse) = batch();
        let exact = model.forward(&dense, &sparse).unwrap();

        let int8 = model.quantize_embeddings(8).unwrap();
        assert_eq!(int8.store().encodings(), vec![Encoding::Int8; 2]);
        assert_eq!(model.store().encodings(), vec![Encoding::Full; 2]);
        let approx = int8.forward(&dense, &sparse).unwrap();
        assert!(exact.max_abs_diff(&approx) < 0.05);

        let half = model.quantize_dense(16).unwrap();
        assert!(exact.max_abs_diff(&half.forward(&dense, &sparse).unwrap()) < 0.01);
        assert!(model.quantize_dense(4).is_err());
        assert!(model.quantize_embeddings(16).is_err());
    }

    #[test]
    fn test_qr_model_rejects_low_bit_tables() {
        let mut cfg = config();
        cfg.qr = Some(QrConfig {
            collisions: 2,
            operation: QrOperation::Mult,
            threshold: 0,
        });
        let model = DlrmModel::build(cfg).unwrap();
        assert!(model.store().bags().all(|b| b.kind() == "quotient-remainder"));
        let err = model.quantize_embeddings(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let (dense, sparse) = batch();
        assert_eq!(model.forward(&dense, &sparse).unwrap().shape(), &[2, 1]);
    }

    #[test]
    fn test_shape_contract() {
        let model = DlrmModel::build(config()).unwrap();
        let contract = model.shape_contract();
        assert_eq!(contract.tables.len(), 2);
        assert_eq!(contract.interaction.output_width, 7);
        assert_eq!(contract.top.widths, vec![7, 8, 1]);
        assert_eq!(contract.top.sigmoid_layer, Some(1));
        assert!(contract.shard_plan.is_none());
        let json = serde_json::to_string(&contract).unwrap();
        let back: ShapeContract = serde_json::from_str(&json).unwrap();
        assert_eq!(back, contract);
    }
}
