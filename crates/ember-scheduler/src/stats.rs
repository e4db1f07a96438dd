//! Scheduler counters and per-shard occupancy

use ember_types::ShardIndex;
use serde::{Deserialize, Serialize};

/// Running totals kept across cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerCounters {
    pub submitted: u64,
    pub admitted: u64,
    pub finished: u64,
    pub aborted: u64,
    pub exported: u64,
    /// Admission attempts turned away for lack of cache
    pub deferred: u64,
    pub batches: u64,
    pub scheduled_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub index: ShardIndex,
    pub capacity: usize,
    pub used_slots: usize,
    pub free_slots: usize,
    pub evictable_slots: usize,
    pub utilization: f64,
    pub prefix_hit_rate: Option<f64>,
}

/// Point-in-time scheduler view, logged every `log_stats_interval` cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub cycle: u64,
    pub waiting: usize,
    pub prefilling: usize,
    pub running: usize,
    /// Requests waiting on an export or import
    pub transferring: usize,
    pub counters: SchedulerCounters,
    pub shards: Vec<ShardStats>,
}

impl SchedulerStats {
    pub fn used_slots(&self) -> usize {
        self.shards.iter().map(|s| s.used_slots).sum()
    }

    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.capacity).sum()
    }
}
