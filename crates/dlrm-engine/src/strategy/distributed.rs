use std::fmt;
use std::thread;

use dlrm_embedding::{SparseBatch, TableInitializer};
use dlrm_layers::{Tensor, WeightInit};
use tracing::{debug, error, info};

use crate::collective::{AllToAllPlan, Collective, LocalCollectiveGroup};
use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::model::{check_batch, DlrmModel};
use crate::shard::ShardPlan;

use super::ExecutionStrategy;

/// One rank of a combined data- and model-parallel group.
///
/// Rank `r` owns rows `rows.range(r)` of every batch and tables
/// `tables.range(r)`. A forward call:
///
/// 1. checks that the batch splits evenly over the ranks,
/// 2. pools its own tables over the whole batch,
/// 3. exchanges pooled rows with an all-to-all so it holds every table for
///    its own rows, while the bottom encoder runs on those rows,
/// 4. interacts and scores its rows,
/// 5. all-gathers the scores so every rank returns the full batch.
///
/// Any failure aborts the collective group, so peers fail instead of
/// waiting forever.
pub struct DistributedStrategy {
    model: DlrmModel,
    collective: Box<dyn Collective>,
    tables: ShardPlan,
}

impl fmt::Debug for DistributedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedStrategy")
            .field("rank", &self.collective.rank())
            .field("world_size", &self.collective.world_size())
            .field("tables", &self.tables)
            .finish()
    }
}

impl DistributedStrategy {
    /// Wraps this rank's shard and waits for every peer to do the same.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShardMismatch`] if the shard does not hold
    /// exactly the tables the shard plan assigns to this rank.
    pub fn new(model: DlrmModel, collective: Box<dyn Collective>) -> Result<Self> {
        let rank = collective.rank();
        let world = collective.world_size();
        let tables = ShardPlan::contiguous(model.config().num_tables(), world);
        let strategy = Self {
            model,
            collective,
            tables,
        };
        if let Err(e) = strategy.check_shard() {
            strategy.collective.abort(&e.to_string());
            return Err(e);
        }
        strategy.collective.barrier()?;
        info!(rank, world, tables = ?strategy.tables.range(rank), "Rank ready");
        Ok(strategy)
    }

    /// This rank's shard.
    pub fn model(&self) -> &DlrmModel {
        &self.model
    }

    /// This rank.
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// Table split across ranks.
    pub fn table_plan(&self) -> &ShardPlan {
        &self.tables
    }

    fn check_shard(&self) -> Result<()> {
        let rank = self.collective.rank();
        let expected: Vec<usize> = self.tables.range(rank).collect();
        let held = self.model.store().global_indices();
        if held != expected {
            return Err(EngineError::ShardMismatch {
                rank,
                expected: expected.len(),
                actual: held.len(),
            });
        }
        Ok(())
    }

    /// Waits for every peer at the end of a run.
    pub fn shutdown(self) -> Result<()> {
        self.collective.barrier()
    }

    /// Scores one batch. Every rank passes the same full batch and gets
    /// back the full `[batch, 1]` score tensor.
    pub fn forward(&self, dense: &Tensor, batch: &SparseBatch) -> Result<Tensor> {
        match self.forward_inner(dense, batch) {
            Ok(scores) => Ok(scores),
            Err(e) => {
                error!(rank = self.rank(), error = %e, "Distributed forward failed");
                self.collective.abort(&e.to_string());
                Err(e)
            }
        }
    }

    fn forward_inner(&self, dense: &Tensor, batch: &SparseBatch) -> Result<Tensor> {
        let rank = self.collective.rank();
        let world = self.collective.world_size();
        let batch_size = dense.rows();
        if batch_size < world {
            return Err(EngineError::BatchSmallerThanRanks {
                batch_size,
                ranks: world,
            });
        }
        if batch_size % world != 0 {
            return Err(EngineError::BatchNotDivisible {
                batch_size,
                ranks: world,
            });
        }
        let num_tables = self.model.config().num_tables();
        check_batch(dense, batch, num_tables)?;
        self.check_shard()?;

        let rows = ShardPlan::contiguous(batch_size, world);
        let my_rows = rows.range(rank);
        let local_dense = dense.slice_rows(my_rows.start, my_rows.end);
        let local_sparse = batch.select_tables(self.tables.range(rank));
        let dim = self.model.config().bottom_output();
        debug!(rank, batch_size, rows = ?my_rows, "Distributed forward");

        // The bottom encoder overlaps the lookup and the exchange.
        let (exchanged, bottom) = thread::scope(|s| {
            let bottom = s.spawn(|| self.model.dense().encode_dense(&local_dense));
            let exchanged = self.exchange_pooled(&local_sparse, &rows, dim);
            let bottom = bottom.join().unwrap_or_else(|_| {
                Err(EngineError::Collective {
                    rank,
                    message: "bottom encoder thread panicked".into(),
                })
            });
            (exchanged, bottom)
        });
        let pooled = exchanged?;
        let x = bottom?;

        let scores = self.model.dense().score(&x, &pooled)?;
        let gathered = self.collective.all_gather(scores.into_data())?;
        let full: Vec<f32> = gathered.into_iter().flatten().collect();
        Ok(Tensor::try_from_data(&[batch_size, 1], full)?)
    }

    /// Pools local tables over the full batch and trades row slices so this
    /// rank ends up with every table for its own rows, in global order.
    fn exchange_pooled(
        &self,
        local_sparse: &SparseBatch,
        rows: &ShardPlan,
        dim: usize,
    ) -> Result<Vec<Tensor>> {
        let rank = self.collective.rank();
        let world = self.collective.world_size();
        let pooled = self.model.lookup(local_sparse)?;

        let sends: Vec<Vec<f32>> = (0..world)
            .map(|p| {
                let r = rows.range(p);
                pooled
                    .iter()
                    .flat_map(|t| t.slice_rows(r.start, r.end).into_data())
                    .collect()
            })
            .collect();
        let plan = AllToAllPlan::pooled_lookup(&self.tables, rows, rank, dim);
        let received = self.collective.all_to_all(sends, &plan)?;

        // Positive: every rank owns at least one row and widths are nonzero.
        let stride = rows.len(rank) * dim;
        let mut out = Vec::with_capacity(self.tables.total());
        for payload in received {
            for chunk in payload.chunks(stride) {
                out.push(Tensor::try_from_data(&[rows.len(rank), dim], chunk.to_vec())?);
            }
        }
        if out.len() != self.tables.total() {
            return Err(EngineError::Collective {
                rank,
                message: format!(
                    "received pooled vectors for {} tables, expected {}",
                    out.len(),
                    self.tables.total()
                ),
            });
        }
        Ok(out)
    }
}

/// Runs `ranks` ranks of `config` as threads of this process.
///
/// Each rank builds its own shard, wraps it in a distributed
/// [`ExecutionStrategy`] over a shared [`LocalCollectiveGroup`] and hands it
/// to `body`. Results come back in rank order. If any rank fails the group
/// is aborted and the first failure that is not a consequence of the abort
/// is returned.
pub fn launch_local<T, F>(
    config: &ModelConfig,
    ranks: usize,
    table_init: &dyn TableInitializer,
    weight_init: &dyn WeightInit,
    body: F,
) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&mut ExecutionStrategy) -> Result<T> + Sync,
{
    if ranks == 0 {
        return Err(EngineError::InvalidConfig {
            message: "rank count must be positive".into(),
        });
    }
    let handles = LocalCollectiveGroup::create(ranks);
    let body = &body;
    let results: Vec<Result<T>> = thread::scope(|s| {
        let joins: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                s.spawn(move || {
                    let rank = handle.rank();
                    let model = match DlrmModel::build_shard(
                        config.clone(),
                        rank,
                        ranks,
                        table_init,
                        weight_init,
                    ) {
                        Ok(m) => m,
                        Err(e) => {
                            handle.abort(&e.to_string());
                            return Err(e);
                        }
                    };
                    let mut strategy =
                        ExecutionStrategy::distributed(model, Box::new(handle.clone()))?;
                    let out = match body(&mut strategy) {
                        Ok(out) => out,
                        Err(e) => {
                            handle.abort(&e.to_string());
                            return Err(e);
                        }
                    };
                    if let ExecutionStrategy::Distributed(d) = strategy {
                        d.shutdown()?;
                    }
                    Ok(out)
                })
            })
            .collect();
        joins
            .into_iter()
            .enumerate()
            .map(|(rank, j)| {
                j.join().unwrap_or_else(|_| {
                    Err(EngineError::Collective {
                        rank,
                        message: "rank thread panicked".into(),
                    })
                })
            })
            .collect()
    });

    let mut outputs = Vec::with_capacity(ranks);
    let mut first_err = None;
    for result in results {
        match result {
            Ok(out) => outputs.push(out),
            Err(e) => {
                let root_cause = !matches!(e, EngineError::Collective { .. });
                match &first_err {
                    None => first_err = Some(e),
                    Some(EngineError::Collective { .. }) if root_cause => first_err = Some(e),
                    Some(_) => {}
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(outputs),
    }
}
