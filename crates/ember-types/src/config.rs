//! Configuration types for ember components

use serde::{Deserialize, Serialize};

use crate::{EmberError, Result, TokenId};

/// Role of this serving instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Prefill and decode in the same pool
    #[default]
    Normal,
    /// Prefill only; finished prompts are held for export
    Prefill,
    /// Decode only; prompt caches arrive through import
    Decode,
}

/// Element type of the cache vectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    FP32,
    #[default]
    FP16,
    BF16,
    INT8,
}

impl DataType {
    /// Width of one element in bytes
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::FP32 => 4,
            DataType::FP16 | DataType::BF16 => 2,
            DataType::INT8 => 1,
        }
    }
}

/// Admission and batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Serving role
    pub run_mode: RunMode,
    /// Total cache slots per shard
    pub max_total_token_num: usize,
    /// Per-step token budget per shard
    pub batch_max_tokens: usize,
    /// Maximum prefill chunk size
    pub chunked_prefill_size: usize,
    /// Split long prompts into chunks
    pub enable_chunked_prefill: bool,
    /// Fraction of capacity held back as admission safety margin
    pub router_token_ratio: f64,
    /// Cap on the decode-growth estimate used for admission
    pub router_max_new_token_len: usize,
    /// Cycles a request may wait before it is promoted over newer arrivals
    pub router_max_wait_tokens: u64,
    /// Maximum requests in prefill or decode per shard
    pub running_max_req_size: usize,
    /// Upper bound on prompt + generated tokens per request
    pub max_req_total_len: usize,
    /// Maximum queued requests
    pub max_waiting_requests: usize,
    /// End-of-sequence token ids
    pub eos_ids: Vec<TokenId>,
    /// Embedding mode: single step, pooled output, no sampling
    pub is_embedding: bool,
    /// Seconds between stats log lines
    pub log_stats_interval: u64,
    /// Suppress the periodic stats line
    pub disable_log_stats: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Normal,
            max_total_token_num: 16384,
            batch_max_tokens: 8192,
            chunked_prefill_size: 4096,
            enable_chunked_prefill: true,
            router_token_ratio: 0.0,
            router_max_new_token_len: 1024,
            router_max_wait_tokens: 6,
            running_max_req_size: 1000,
            max_req_total_len: 3072,
            max_waiting_requests: 4096,
            eos_ids: vec![TokenId::new(2)],
            is_embedding: false,
            log_stats_interval: 10,
            disable_log_stats: false,
        }
    }
}

impl RouterConfig {
    /// Slots held back from admission
    pub fn safety_margin(&self) -> usize {
        (self.max_total_token_num as f64 * self.router_token_ratio).floor() as usize
    }

    /// Slots admission may plan against
    pub fn admission_limit(&self) -> usize {
        self.max_total_token_num.saturating_sub(self.safety_margin())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_total_token_num == 0 {
            return Err(EmberError::config("max_total_token_num must be positive"));
        }
        if self.batch_max_tokens == 0 {
            return Err(EmberError::config("batch_max_tokens must be positive"));
        }
        if self.chunked_prefill_size == 0 {
            return Err(EmberError::config("chunked_prefill_size must be positive"));
        }
        if self.enable_chunked_prefill && self.chunked_prefill_size > self.batch_max_tokens {
            return Err(EmberError::config(format!(
                "chunked_prefill_size ({}) exceeds batch_max_tokens ({})",
                self.chunked_prefill_size, self.batch_max_tokens
            )));
        }
        if !(0.0..1.0).contains(&self.router_token_ratio) {
            return Err(EmberError::config("router_token_ratio must be in [0, 1)"));
        }
        if self.router_max_new_token_len == 0 {
            return Err(EmberError::config("router_max_new_token_len must be positive"));
        }
        if self.running_max_req_size == 0 {
            return Err(EmberError::config("running_max_req_size must be positive"));
        }
        if self.max_req_total_len == 0 {
            return Err(EmberError::config("max_req_total_len must be positive"));
        }
        Ok(())
    }
}

/// KV cache layout and prefix-cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    /// Attention heads stored per token
    pub head_num: usize,
    /// Elements per head
    pub head_dim: usize,
    /// Element type
    pub dtype: DataType,
    /// Share prompt prefixes across requests
    pub use_dynamic_prompt_cache: bool,
    /// Maximum tokens retained by the prefix cache
    pub cache_capacity: usize,
    /// Free-slot reservation margin as a fraction of pool capacity
    pub cache_reserved_ratio: f64,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            head_num: 8,
            head_dim: 128,
            dtype: DataType::FP16,
            use_dynamic_prompt_cache: false,
            cache_capacity: 8192,
            cache_reserved_ratio: 0.05,
        }
    }
}

impl KvCacheConfig {
    /// Bytes in one token's cache vector
    pub fn vector_bytes(&self) -> usize {
        self.head_num * self.head_dim * self.dtype.size_in_bytes()
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_num == 0 || self.head_dim == 0 {
            return Err(EmberError::config("head_num and head_dim must be positive"));
        }
        if !(0.0..1.0).contains(&self.cache_reserved_ratio) {
            return Err(EmberError::config("cache_reserved_ratio must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Data-parallel layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Number of data-parallel shards
    pub dp: usize,
    /// Devices backing each shard; each holds a full copy of the shard cache
    pub cards_per_shard: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            dp: 1,
            cards_per_shard: 1,
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dp == 0 {
            return Err(EmberError::config("dp must be positive"));
        }
        if self.cards_per_shard == 0 {
            return Err(EmberError::config("cards_per_shard must be positive"));
        }
        Ok(())
    }
}

/// Copy-worker tuning for KV relocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Parallel copy workers; bounds the share of the device taken from compute
    pub worker_count: usize,
    /// Elements moved per tile
    pub tile_elems: usize,
    /// Tiles in flight per worker
    pub num_stages: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            worker_count: 20,
            tile_elems: 256,
            num_stages: 3,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(EmberError::config("transfer worker_count must be positive"));
        }
        if self.tile_elems == 0 {
            return Err(EmberError::config("transfer tile_elems must be positive"));
        }
        if self.num_stages == 0 {
            return Err(EmberError::config("transfer num_stages must be positive"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format ("pretty" or "json")
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
