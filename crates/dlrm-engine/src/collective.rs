//! Collective communication between ranks.
//!
//! The distributed strategy talks to its peers only through the
//! [`Collective`] trait: a personalized all-to-all, an all-gather, a
//! barrier and an abort. [`LocalCollectiveGroup`] implements it for ranks
//! running as threads of one process.
//!
//! Every call is blocking and every rank must issue the same sequence of
//! calls. There is no timeout: a rank that never arrives stalls its peers
//! until some rank calls [`Collective::abort`], after which every pending
//! and future call on the group fails.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::shard::ShardPlan;

/// Element counts one rank sends to and expects from every peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllToAllPlan {
    /// `send_counts[p]` elements go to rank `p`.
    pub send_counts: Vec<usize>,
    /// `recv_counts[p]` elements arrive from rank `p`.
    pub recv_counts: Vec<usize>,
}

impl AllToAllPlan {
    /// Counts for exchanging pooled lookup vectors of width `dim`.
    ///
    /// Rank `r` pooled its tables `tables.range(r)` over the whole batch and
    /// sends each peer `p` the rows `rows.range(p)` of every one of them. In
    /// return it receives its own rows of every table `p` owns.
    ///
    /// ```
    /// use dlrm_engine::collective::AllToAllPlan;
    /// use dlrm_engine::shard::ShardPlan;
    ///
    /// let tables = ShardPlan::contiguous(3, 2); // [2, 1]
    /// let rows = ShardPlan::contiguous(4, 2); // [2, 2]
    /// let plan = AllToAllPlan::pooled_lookup(&tables, &rows, 0, 8);
    /// assert_eq!(plan.send_counts, vec![32, 32]);
    /// assert_eq!(plan.recv_counts, vec![32, 16]);
    /// ```
    pub fn pooled_lookup(tables: &ShardPlan, rows: &ShardPlan, rank: usize, dim: usize) -> Self {
        let world = rows.parts();
        let send_counts = (0..world)
            .map(|p| tables.len(rank) * rows.len(p) * dim)
            .collect();
        let recv_counts = (0..world)
            .map(|p| tables.len(p) * rows.len(rank) * dim)
            .collect();
        Self {
            send_counts,
            recv_counts,
        }
    }
}

/// Blocking collective operations over a fixed group of ranks.
pub trait Collective: Send + Sync {
    /// This rank.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Sends `sends[p]` to every rank `p` and returns what every rank sent
    /// here, indexed by source rank.
    ///
    /// Payload sizes are checked against `plan` on both sides.
    fn all_to_all(&self, sends: Vec<Vec<f32>>, plan: &AllToAllPlan) -> Result<Vec<Vec<f32>>>;

    /// Returns every rank's `data`, indexed by rank.
    fn all_gather(&self, data: Vec<f32>) -> Result<Vec<Vec<f32>>>;

    /// Returns once every rank has called it.
    fn barrier(&self) -> Result<()>;

    /// Fails every pending and future call on the group.
    fn abort(&self, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filling,
    Draining,
}

#[derive(Debug)]
struct Exchange {
    phase: Phase,
    arrived: usize,
    departed: usize,
    /// `mailbox[src][dst]`
    mailbox: Vec<Vec<Option<Vec<f32>>>>,
    generation: u64,
    aborted: Option<String>,
}

#[derive(Debug)]
struct Shared {
    world: usize,
    state: Mutex<Exchange>,
    cond: Condvar,
}

/// Creates the in-process collective handles of a group.
#[derive(Debug)]
pub struct LocalCollectiveGroup;

impl LocalCollectiveGroup {
    /// Returns one handle per rank, in rank order.
    pub fn create(world: usize) -> Vec<LocalCollective> {
        let shared = Arc::new(Shared {
            world,
            state: Mutex::new(Exchange {
                phase: Phase::Filling,
                arrived: 0,
                departed: 0,
                mailbox: vec![vec![None; world]; world],
                generation: 0,
                aborted: None,
            }),
            cond: Condvar::new(),
        });
        (0..world)
            .map(|rank| LocalCollective {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank's handle on an in-process group.
#[derive(Debug, Clone)]
pub struct LocalCollective {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalCollective {
    fn failure(&self, message: impl Into<String>) -> EngineError {
        EngineError::Collective {
            rank: self.rank,
            message: message.into(),
        }
    }

    /// Deposits one payload per destination and collects one per source.
    fn exchange(&self, payloads: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let world = self.shared.world;
        if payloads.len() != world {
            return Err(self.failure(format!(
                "{} payloads for a group of {world}",
                payloads.len()
            )));
        }
        let mut state = self.shared.state.lock();

        // Wait for the previous round to drain.
        while state.phase == Phase::Draining && state.aborted.is_none() {
            self.shared.cond.wait(&mut state);
        }
        if let Some(reason) = &state.aborted {
            return Err(self.failure(format!("group aborted: {reason}")));
        }

        let generation = state.generation;
        for (dst, payload) in payloads.into_iter().enumerate() {
            state.mailbox[self.rank][dst] = Some(payload);
        }
        state.arrived += 1;
        if state.arrived == world {
            state.phase = Phase::Draining;
            self.shared.cond.notify_all();
        } else {
            while state.phase == Phase::Filling
                && state.generation == generation
                && state.aborted.is_none()
            {
                self.shared.cond.wait(&mut state);
            }
        }
        if let Some(reason) = &state.aborted {
            return Err(self.failure(format!("group aborted: {reason}")));
        }

        let mut received = Vec::with_capacity(world);
        for src in 0..world {
            match state.mailbox[src][self.rank].take() {
                Some(payload) => received.push(payload),
                None => return Err(self.failure(format!("no payload from rank {src}"))),
            }
        }
        state.departed += 1;
        if state.departed == world {
            state.arrived = 0;
            state.departed = 0;
            state.generation += 1;
            state.phase = Phase::Filling;
            self.shared.cond.notify_all();
        }
        Ok(received)
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world
    }

    fn all_to_all(&self, sends: Vec<Vec<f32>>, plan: &AllToAllPlan) -> Result<Vec<Vec<f32>>> {
        for (p, (payload, &count)) in sends.iter().zip(&plan.send_counts).enumerate() {
            if payload.len() != count {
                return Err(self.failure(format!(
                    "all-to-all sends {} elements to rank {p}, plan says {count}",
                    payload.len()
                )));
            }
        }
        let received = self.exchange(sends)?;
        for (p, (payload, &count)) in received.iter().zip(&plan.recv_counts).enumerate() {
            if payload.len() != count {
                return Err(self.failure(format!(
                    "all-to-all received {} elements from rank {p}, plan says {count}",
                    payload.len()
                )));
            }
        }
        debug!(rank = self.rank, "all-to-all complete");
        Ok(received)
    }

    fn all_gather(&self, data: Vec<f32>) -> Result<Vec<Vec<f32>>> {
        let payloads = vec![data; self.shared.world];
        self.exchange(payloads)
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(vec![Vec::new(); self.shared.world]).map(|_| ())
    }

    fn abort(&self, reason: &str) {
        let mut state = self.shared.state.lock();
        if state.aborted.is_none() {
            warn!(rank = self.rank, reason, "Aborting collective group");
            state.aborted = Some(format!("rank {}: {reason}", self.rank));
        }
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_all_to_all_and_gather() {
        let handles = LocalCollectiveGroup::create(3);
        let results: Vec<_> = handles
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let r = c.rank() as f32;
                    let sends: Vec<Vec<f32>> = (0..3).map(|p| vec![r * 10.0 + p as f32]).collect();
                    let plan = AllToAllPlan {
                        send_counts: vec![1; 3],
                        recv_counts: vec![1; 3],
                    };
                    let got = c.all_to_all(sends, &plan).unwrap();
                    let gathered = c.all_gather(vec![r]).unwrap();
                    c.barrier().unwrap();
                    (c.rank(), got, gathered)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        for (rank, got, gathered) in results {
            let expected: Vec<Vec<f32>> =
                (0..3).map(|src| vec![src as f32 * 10.0 + rank as f32]).collect();
            assert_eq!(got, expected);
            assert_eq!(gathered, vec![vec![0.0], vec![1.0], vec![2.0]]);
        }
    }

    #[test]
    fn test_many_rounds() {
        let handles = LocalCollectiveGroup::create(4);
        let joins: Vec<_> = handles
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    for round in 0..50 {
                        let g = c.all_gather(vec![round as f32, c.rank() as f32]).unwrap();
                        assert!(g.iter().all(|v| v[0] == round as f32));
                    }
                })
            })
            .collect();
        for j in joins {
            j.join().unwrap();
        }
    }

    #[test]
    fn test_plan_mismatch_is_reported() {
        let handles = LocalCollectiveGroup::create(1);
        let plan = AllToAllPlan {
            send_counts: vec![2],
            recv_counts: vec![2],
        };
        let err = handles[0].all_to_all(vec![vec![1.0]], &plan).unwrap_err();
        assert!(matches!(err, EngineError::Collective { rank: 0, .. }));
    }

    #[test]
    fn test_abort_releases_waiting_peer() {
        let mut handles = LocalCollectiveGroup::create(2);
        let failing = handles.pop().unwrap();
        let waiting = handles.pop().unwrap();
        let join = thread::spawn(move || waiting.barrier());
        failing.abort("shard mismatch");
        let err = join.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("shard mismatch"));
        assert!(failing.all_gather(vec![]).is_err());
    }
}
