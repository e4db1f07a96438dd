//! One data-parallel shard's cache: slot pool plus optional prefix cache

use crate::handle::HandleTable;
use crate::pool::{MemoryPool, PoolStats};
use crate::prefix::{PrefixCache, PrefixCacheStats, PrefixMatch};
use ember_types::{KvCacheConfig, Result, ShardIndex, SlotIndex, TokenId};
use tracing::{debug, trace};

/// Slot manager for one shard.
///
/// Owns the free set; eviction of unreferenced prefix chains happens inside
/// [`KvShard::reserve`] when free slots would drop below the reservation margin.
#[derive(Debug)]
pub struct KvShard {
    index: ShardIndex,
    pool: MemoryPool,
    prefix: Option<PrefixCache>,
    reserve_margin: usize,
}

impl KvShard {
    pub fn new(
        index: ShardIndex,
        capacity: usize,
        kv: &KvCacheConfig,
        cards: usize,
    ) -> Result<Self> {
        kv.validate()?;
        let pool = MemoryPool::new(capacity, kv, cards)?;
        let prefix = kv
            .use_dynamic_prompt_cache
            .then(|| PrefixCache::new(kv.cache_capacity));
        let reserve_margin = (capacity as f64 * kv.cache_reserved_ratio).ceil() as usize;
        debug!(
            "Shard {}: capacity={}, prefix_cache={}, reserve_margin={}",
            index,
            capacity,
            prefix.is_some(),
            reserve_margin
        );
        Ok(Self {
            index,
            pool,
            prefix,
            reserve_margin,
        })
    }

    pub fn index(&self) -> ShardIndex {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.pool.free_slots()
    }

    pub fn used_slots(&self) -> usize {
        self.pool.used_slots()
    }

    /// Slots held only by the prefix cache and reclaimable on demand
    pub fn evictable_slots(&self) -> usize {
        self.prefix
            .as_ref()
            .map(PrefixCache::evictable_tokens)
            .unwrap_or(0)
    }

    /// Used slots that admission must treat as committed
    pub fn committed_slots(&self) -> usize {
        self.used_slots() - self.evictable_slots()
    }

    pub fn prefix_enabled(&self) -> bool {
        self.prefix.is_some()
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn handles(&self) -> HandleTable {
        self.pool.handles()
    }

    /// Reserve `n` slots, evicting cached prefixes first if the margin requires it
    pub fn reserve(&mut self, n: usize) -> Result<Vec<SlotIndex>> {
        if let Some(prefix) = self.prefix.as_mut() {
            let wanted = n + self.reserve_margin;
            let free = self.pool.free_slots();
            if free < wanted {
                let freed = prefix.evict(wanted - free);
                if !freed.is_empty() {
                    trace!("Shard {} evicted {} prefix slots", self.index, freed.len());
                    self.pool.release(&freed)?;
                }
            }
        }
        self.pool.reserve(n)
    }

    /// Look up a cached prefix; empty when prefix caching is off
    pub fn match_prefix(&mut self, tokens: &[TokenId]) -> PrefixMatch {
        match self.prefix.as_mut() {
            Some(prefix) => prefix.match_prefix(tokens),
            None => PrefixMatch::default(),
        }
    }

    /// Undo a [`Self::match_prefix`] without retiring anything
    pub fn release_prefix(&mut self, tokens: &[TokenId]) -> Result<()> {
        match self.prefix.as_mut() {
            Some(prefix) if !tokens.is_empty() => prefix.release_prefix(tokens),
            _ => Ok(()),
        }
    }

    /// Return a finished request's slots.
    ///
    /// `slots[..matched]` belong to the prefix cache. When `cacheable` is given
    /// (the prompt was fully ingested) it is offered to the prefix cache with the
    /// matching leading slots; everything the cache does not adopt goes back to
    /// the pool.
    pub fn retire(
        &mut self,
        prompt: &[TokenId],
        matched: usize,
        slots: &[SlotIndex],
        cacheable: bool,
    ) -> Result<()> {
        let Some(prefix) = self.prefix.as_mut() else {
            return self.pool.release(slots);
        };

        if matched > 0 {
            prefix.release_prefix(&prompt[..matched])?;
        }

        if cacheable && prompt.len() <= slots.len() {
            let surplus = prefix.insert(prompt, &slots[..prompt.len()])?;
            self.pool.release(&surplus)?;
            self.pool.release(&slots[prompt.len()..])?;
            let evicted = prefix.enforce_capacity();
            self.pool.release(&evicted)?;
        } else {
            self.pool.release(&slots[matched.min(slots.len())..])?;
        }
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn prefix_stats(&self) -> Option<PrefixCacheStats> {
        self.prefix.as_ref().map(PrefixCache::stats)
    }
}
