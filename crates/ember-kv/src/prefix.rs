//! Prefix caching for shared prompt slots.
//!
//! A token trie where each node owns the cache slot of one prompt token. A
//! request that matches a path holds a reference on every node along it, so a
//! child's count never exceeds its parent's and unreferenced nodes always form
//! whole subtrees. Eviction removes unreferenced leaves in LRU order, which
//! peels chains from the tail.

use ember_types::{EmberError, Result, SlotIndex, TokenId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, trace};

const ROOT: usize = 0;

#[derive(Debug)]
struct Node {
    slot: SlotIndex,
    parent: usize,
    token: TokenId,
    children: HashMap<TokenId, usize>,
    ref_count: usize,
    last_access: u64,
    live: bool,
}

/// Result of a prefix lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Slots of the matched tokens, in prompt order
    pub slots: Vec<SlotIndex>,
}

impl PrefixMatch {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Prefix cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefixCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cached_tokens: usize,
    pub evictable_tokens: usize,
    pub hit_rate: f64,
}

/// Token trie over pool slots with reference counting
#[derive(Debug)]
pub struct PrefixCache {
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    capacity: usize,
    clock: u64,
    cached_tokens: usize,
    evictable_tokens: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PrefixCache {
    /// Create an empty cache retaining at most `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        let root = Node {
            slot: 0,
            parent: ROOT,
            token: TokenId::new(0),
            children: HashMap::new(),
            ref_count: 0,
            last_access: 0,
            live: true,
        };
        Self {
            nodes: vec![root],
            vacant: Vec::new(),
            capacity,
            clock: 0,
            cached_tokens: 0,
            evictable_tokens: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens (and slots) currently owned by the cache
    pub fn cached_tokens(&self) -> usize {
        self.cached_tokens
    }

    /// Owned slots no live request references
    pub fn evictable_tokens(&self) -> usize {
        self.evictable_tokens
    }

    fn child(&self, parent: usize, token: TokenId) -> Option<usize> {
        self.nodes[parent].children.get(&token).copied()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Longest cached prefix of `tokens`; takes a reference on every matched node
    pub fn match_prefix(&mut self, tokens: &[TokenId]) -> PrefixMatch {
        let now = self.tick();
        let mut cursor = ROOT;
        let mut slots = Vec::new();

        for &token in tokens {
            let Some(next) = self.child(cursor, token) else {
                break;
            };
            if self.nodes[next].ref_count == 0 {
                self.evictable_tokens -= 1;
            }
            let node = &mut self.nodes[next];
            node.ref_count += 1;
            node.last_access = now;
            slots.push(node.slot);
            cursor = next;
        }

        if slots.is_empty() {
            self.misses += 1;
            trace!("Prefix cache miss for {} tokens", tokens.len());
        } else {
            self.hits += 1;
            trace!("Prefix cache hit: {} of {} tokens", slots.len(), tokens.len());
        }
        PrefixMatch { slots }
    }

    /// Drop the references taken by a [`Self::match_prefix`] of `tokens`
    pub fn release_prefix(&mut self, tokens: &[TokenId]) -> Result<()> {
        let mut path = Vec::with_capacity(tokens.len());
        let mut cursor = ROOT;
        for &token in tokens {
            let next = self.child(cursor, token).ok_or_else(|| {
                EmberError::invalid_state("released prefix is not in the cache")
            })?;
            if self.nodes[next].ref_count == 0 {
                return Err(EmberError::invalid_state(
                    "cannot remove reference from unreferenced prefix",
                ));
            }
            path.push(next);
            cursor = next;
        }

        for idx in path {
            let node = &mut self.nodes[idx];
            node.ref_count -= 1;
            if node.ref_count == 0 {
                self.evictable_tokens += 1;
            }
        }
        Ok(())
    }

    /// Adopt `slots` as the cache of `tokens`.
    ///
    /// Returns the slots the cache did not take because the token was already
    /// cached under a different slot; the caller releases those to the pool.
    pub fn insert(&mut self, tokens: &[TokenId], slots: &[SlotIndex]) -> Result<Vec<SlotIndex>> {
        if tokens.len() != slots.len() {
            return Err(EmberError::malformed_request(format!(
                "prefix insert of {} tokens with {} slots",
                tokens.len(),
                slots.len()
            )));
        }

        let now = self.tick();
        let mut surplus = Vec::new();
        let mut cursor = ROOT;
        let mut adopted = 0usize;

        for (&token, &slot) in tokens.iter().zip(slots) {
            match self.child(cursor, token) {
                Some(existing) => {
                    let node = &mut self.nodes[existing];
                    node.last_access = now;
                    if node.slot != slot {
                        surplus.push(slot);
                    }
                    cursor = existing;
                }
                None => {
                    let node = Node {
                        slot,
                        parent: cursor,
                        token,
                        children: HashMap::new(),
                        ref_count: 0,
                        last_access: now,
                        live: true,
                    };
                    let idx = match self.vacant.pop() {
                        Some(idx) => {
                            self.nodes[idx] = node;
                            idx
                        }
                        None => {
                            self.nodes.push(node);
                            self.nodes.len() - 1
                        }
                    };
                    self.nodes[cursor].children.insert(token, idx);
                    self.cached_tokens += 1;
                    self.evictable_tokens += 1;
                    adopted += 1;
                    cursor = idx;
                }
            }
        }

        debug!(
            "Prefix insert: {} tokens, {} adopted, {} surplus",
            tokens.len(),
            adopted,
            surplus.len()
        );
        Ok(surplus)
    }

    /// Evict up to `max_tokens` unreferenced tokens, least recently used first.
    ///
    /// Returns the freed slots.
    pub fn evict(&mut self, max_tokens: usize) -> Vec<SlotIndex> {
        let mut freed = Vec::new();
        if max_tokens == 0 || self.evictable_tokens == 0 {
            return freed;
        }

        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = self
            .nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, n)| n.live && n.ref_count == 0 && n.children.is_empty())
            .map(|(idx, n)| Reverse((n.last_access, idx)))
            .collect();

        while freed.len() < max_tokens {
            let Some(Reverse((_, idx))) = heap.pop() else {
                break;
            };
            let node = &mut self.nodes[idx];
            if !node.live {
                continue;
            }
            node.live = false;
            let (parent, token, slot) = (node.parent, node.token, node.slot);
            self.vacant.push(idx);
            self.nodes[parent].children.remove(&token);
            self.cached_tokens -= 1;
            self.evictable_tokens -= 1;
            self.evictions += 1;
            freed.push(slot);

            if parent != ROOT {
                let p = &self.nodes[parent];
                if p.ref_count == 0 && p.children.is_empty() {
                    heap.push(Reverse((p.last_access, parent)));
                }
            }
        }

        if !freed.is_empty() {
            debug!("Evicted {} prefix tokens", freed.len());
        }
        freed
    }

    /// Evict until the cache is within its token capacity
    pub fn enforce_capacity(&mut self) -> Vec<SlotIndex> {
        let excess = self.cached_tokens.saturating_sub(self.capacity);
        self.evict(excess)
    }

    pub fn stats(&self) -> PrefixCacheStats {
        let lookups = self.hits + self.misses;
        PrefixCacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            cached_tokens: self.cached_tokens,
            evictable_tokens: self.evictable_tokens,
            hit_rate: if lookups > 0 {
                self.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}
