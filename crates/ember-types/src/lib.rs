//! Core type definitions for the ember serving core
//!
//! Identifiers, configuration, sampling parameters, the error taxonomy and the
//! cross-process request record shared by the scheduler, the backend workers and
//! output consumers.

pub mod config;
pub mod errors;
pub mod ids;
pub mod record;
pub mod requests;
pub mod sampling;

pub use config::*;
pub use errors::*;
pub use ids::*;
pub use record::*;
pub use requests::*;
pub use sampling::*;

/// Result type used throughout ember
pub type Result<T> = std::result::Result<T, EmberError>;

/// Index of a cache slot within a memory pool
pub type SlotIndex = u32;

/// Index of a data-parallel shard
pub type ShardIndex = usize;
