//! Token-granular KV cache memory for the ember serving core
//!
//! - [`KvStorage`]: per-card buffer of per-token cache vectors
//! - [`MemoryPool`]: fixed-capacity slot accounting over one shard's cards
//! - [`MemoryHandle`] / [`HandleTable`]: opaque references used by the transfer layer
//! - [`PrefixCache`]: reference-counted sharing of prompt prefixes
//! - [`KvShard`]: pool + prefix cache with margin-driven eviction

pub mod handle;
pub mod pool;
pub mod prefix;
pub mod shard;
pub mod storage;

pub use handle::{HandleRegistry, HandleTable, MemoryHandle};
pub use pool::{MemoryPool, PoolStats};
pub use prefix::{PrefixCache, PrefixCacheStats, PrefixMatch};
pub use shard::KvShard;
pub use storage::{KvShape, KvStorage};
