//! Continuous-batching scheduler for the ember serving core
//!
//! Owns every shard's slot pool and prefix cache, orders waiting requests,
//! admits them against a projected cache footprint and turns each cycle into
//! one [`ember_interfaces::Batch`] per shard.

pub mod queue;
pub mod request;
pub mod scheduler;
pub mod stats;

pub use queue::{QueueKey, WaitQueue};
pub use request::{ExportTicket, ImportTarget, RequestState, Resolution, ScheduledRequest};
pub use scheduler::{SchedulePlan, Scheduler};
pub use stats::{SchedulerCounters, SchedulerStats, ShardStats};
