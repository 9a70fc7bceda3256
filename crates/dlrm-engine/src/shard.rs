//! Partitioning of tables and batch rows across execution units.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Contiguous, near-even split of `total` items over `parts` owners.
///
/// With `total = k * parts + m`, the first `m` owners get `k + 1` items and
/// the rest get `k`. Ranges are disjoint, cover `0..total`, and differ in
/// length by at most one.
///
/// # Example
///
/// ```
/// use dlrm_engine::shard::ShardPlan;
///
/// let plan = ShardPlan::contiguous(8, 3);
/// assert_eq!(plan.range(0), 0..3);
/// assert_eq!(plan.range(1), 3..6);
/// assert_eq!(plan.range(2), 6..8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlan {
    total: usize,
    bounds: Vec<usize>,
}

impl ShardPlan {
    /// Splits `total` items over `parts` owners.
    pub fn contiguous(total: usize, parts: usize) -> Self {
        let parts = parts.max(1);
        let (k, m) = (total / parts, total % parts);
        let mut bounds = Vec::with_capacity(parts + 1);
        bounds.push(0);
        for p in 0..parts {
            let len = if p < m { k + 1 } else { k };
            bounds.push(bounds[p] + len);
        }
        Self { total, bounds }
    }

    /// Number of owners.
    pub fn parts(&self) -> usize {
        self.bounds.len() - 1
    }

    /// Items split.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Items owned by `part`.
    pub fn range(&self, part: usize) -> Range<usize> {
        self.bounds[part]..self.bounds[part + 1]
    }

    /// Number of items owned by `part`.
    pub fn len(&self, part: usize) -> usize {
        self.bounds[part + 1] - self.bounds[part]
    }

    /// Item counts of every owner.
    pub fn sizes(&self) -> Vec<usize> {
        self.bounds.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Owner of `item`.
    pub fn owner(&self, item: usize) -> Option<usize> {
        if item >= self.total {
            return None;
        }
        Some(self.bounds.partition_point(|&b| b <= item) - 1)
    }
}

/// Round-robin assignment of tables to devices: table `k` goes to device
/// `k % devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    devices: usize,
    tables: usize,
}

impl DeviceAssignment {
    /// Assigns `tables` tables over `devices` devices.
    pub fn round_robin(tables: usize, devices: usize) -> Self {
        Self {
            devices: devices.max(1),
            tables,
        }
    }

    /// Number of devices.
    pub fn devices(&self) -> usize {
        self.devices
    }

    /// Device owning table `k`.
    pub fn device_of(&self, table: usize) -> usize {
        table % self.devices
    }

    /// Tables owned by `device`, ascending.
    pub fn tables_of(&self, device: usize) -> Vec<usize> {
        (device..self.tables).step_by(self.devices).collect()
    }
}
