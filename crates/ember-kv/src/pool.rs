//! Slot pool for token-granular KV cache memory

use crate::handle::{HandleTable, MemoryHandle};
use crate::storage::{KvShape, KvStorage};
use ember_types::{EmberError, KvCacheConfig, PoolId, Result, SlotIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free_slots: usize,
    pub used_slots: usize,
    pub total_reserved: u64,
    pub total_released: u64,
    pub failed_reservations: u64,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used_slots as f64 / self.capacity as f64
        }
    }
}

/// Fixed-capacity set of cache slots.
///
/// A slot is either free or reserved; `reserve`/`release` are the only mutators
/// and take `&mut self`, so the owner serializes them. Every card holds a full
/// copy of the slot space.
#[derive(Debug)]
pub struct MemoryPool {
    id: PoolId,
    capacity: usize,
    free: VecDeque<SlotIndex>,
    reserved: Vec<bool>,
    cards: Vec<Arc<KvStorage>>,
    total_reserved: u64,
    total_released: u64,
    failed_reservations: u64,
}

impl MemoryPool {
    /// Create a pool of `capacity` slots backed by `cards` buffers
    pub fn new(capacity: usize, kv: &KvCacheConfig, cards: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EmberError::invalid_parameter("pool capacity must be positive"));
        }
        if capacity > SlotIndex::MAX as usize {
            return Err(EmberError::invalid_parameter(format!(
                "pool capacity {} exceeds slot index range",
                capacity
            )));
        }
        if cards == 0 {
            return Err(EmberError::invalid_parameter("pool needs at least one card"));
        }

        let shape = KvShape {
            slots: capacity,
            head_num: kv.head_num,
            head_dim: kv.head_dim,
            dtype: kv.dtype,
        };
        let cards = (0..cards)
            .map(|_| KvStorage::new(shape).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let id = PoolId::new();
        debug!(
            "Creating memory pool {}: capacity={}, cards={}, vector_bytes={}",
            id,
            capacity,
            cards.len(),
            shape.vector_bytes()
        );

        Ok(Self {
            id,
            capacity,
            free: (0..capacity as SlotIndex).collect(),
            reserved: vec![false; capacity],
            cards,
            total_reserved: 0,
            total_released: 0,
            failed_reservations: 0,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn used_slots(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub fn is_reserved(&self, slot: SlotIndex) -> bool {
        self.reserved.get(slot as usize).copied().unwrap_or(false)
    }

    pub fn shape(&self) -> KvShape {
        self.cards[0].shape()
    }

    /// Reserve `n` slots, all or nothing
    pub fn reserve(&mut self, n: usize) -> Result<Vec<SlotIndex>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > self.free.len() {
            self.failed_reservations += 1;
            trace!(
                "Pool {} cannot reserve {} slots ({} free)",
                self.id,
                n,
                self.free.len()
            );
            return Err(EmberError::out_of_memory(n, self.free.len(), self.capacity));
        }

        let slots: Vec<SlotIndex> = self.free.drain(..n).collect();
        for &slot in &slots {
            self.reserved[slot as usize] = true;
        }
        self.total_reserved += n as u64;
        trace!("Pool {} reserved {} slots", self.id, n);
        Ok(slots)
    }

    /// Return slots to the free set; empty input is a no-op.
    ///
    /// The whole call is validated first so a bad index leaves the pool untouched.
    pub fn release(&mut self, slots: &[SlotIndex]) -> Result<()> {
        if slots.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::with_capacity(slots.len());
        for &slot in slots {
            let idx = slot as usize;
            if idx >= self.capacity {
                return Err(EmberError::invalid_state(format!(
                    "release of slot {} outside pool of {}",
                    slot, self.capacity
                )));
            }
            if !self.reserved[idx] {
                return Err(EmberError::invalid_state(format!(
                    "release of unreserved slot {}",
                    slot
                )));
            }
            if !seen.insert(slot) {
                return Err(EmberError::invalid_state(format!(
                    "slot {} released twice in one call",
                    slot
                )));
            }
        }

        for &slot in slots {
            self.reserved[slot as usize] = false;
            self.free.push_back(slot);
        }
        self.total_released += slots.len() as u64;
        trace!("Pool {} released {} slots", self.id, slots.len());
        Ok(())
    }

    /// Handle for one card's buffer
    pub fn handle(&self, card: usize) -> Result<MemoryHandle> {
        let storage = self.cards.get(card).ok_or_else(|| {
            EmberError::not_found(format!("pool {} has no card {}", self.id, card))
        })?;
        Ok(MemoryHandle::new(self.id, card, storage.clone()))
    }

    /// Handles for every card, in card order
    pub fn handles(&self) -> HandleTable {
        self.cards
            .iter()
            .enumerate()
            .map(|(card, storage)| MemoryHandle::new(self.id, card, storage.clone()))
            .collect()
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            free_slots: self.free_slots(),
            used_slots: self.used_slots(),
            total_reserved: self.total_reserved,
            total_released: self.total_released,
            failed_reservations: self.failed_reservations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> KvCacheConfig {
        KvCacheConfig {
            head_num: 1,
            head_dim: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_creation() {
        let pool = MemoryPool::new(100, &kv(), 1).unwrap();
        assert_eq!(pool.capacity(), 100);
        assert_eq!(pool.free_slots(), 100);
        assert_eq!(pool.used_slots(), 0);
        assert!(MemoryPool::new(0, &kv(), 1).is_err());
        assert!(MemoryPool::new(4, &kv(), 0).is_err());
    }

    #[test]
    fn test_reserve_and_release() {
        let mut pool = MemoryPool::new(100, &kv(), 1).unwrap();
        let slots = pool.reserve(50).unwrap();
        assert_eq!(slots.len(), 50);
        assert_eq!(pool.used_slots() + pool.free_slots(), 100);
        assert!(slots.iter().all(|&s| pool.is_reserved(s)));

        pool.release(&slots).unwrap();
        assert_eq!(pool.free_slots(), 100);
        assert_eq!(pool.stats().total_released, 50);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let mut pool = MemoryPool::new(100, &kv(), 1).unwrap();
        let _first = pool.reserve(60).unwrap();
        let err = pool.reserve(60).unwrap_err();
        assert_eq!(err, EmberError::out_of_memory(60, 40, 100));
        assert_eq!(pool.free_slots(), 40);
        assert_eq!(pool.stats().failed_reservations, 1);
    }

    #[test]
    fn test_zero_and_empty_are_noops() {
        let mut pool = MemoryPool::new(8, &kv(), 1).unwrap();
        assert!(pool.reserve(0).unwrap().is_empty());
        pool.release(&[]).unwrap();
        assert_eq!(pool.free_slots(), 8);
    }

    #[test]
    fn test_double_release_rejected() {
        let mut pool = MemoryPool::new(8, &kv(), 1).unwrap();
        let slots = pool.reserve(2).unwrap();
        pool.release(&slots).unwrap();
        assert!(matches!(
            pool.release(&slots),
            Err(EmberError::InvalidState { .. })
        ));
        let more = pool.reserve(1).unwrap();
        assert!(pool.release(&[more[0], more[0]]).is_err());
        assert!(pool.is_reserved(more[0]));
        assert!(pool.release(&[99]).is_err());
    }

    #[test]
    fn test_no_slot_handed_out_twice() {
        let mut pool = MemoryPool::new(64, &kv(), 1).unwrap();
        let mut held: HashSet<SlotIndex> = HashSet::new();
        for round in 0..20 {
            let slots = pool.reserve(3).unwrap();
            for s in &slots {
                assert!(held.insert(*s), "slot {} reserved twice", s);
            }
            if round % 3 == 2 {
                let victims: Vec<_> = held.iter().copied().take(4).collect();
                pool.release(&victims).unwrap();
                for v in victims {
                    held.remove(&v);
                }
            }
            assert_eq!(held.len() + pool.free_slots(), 64);
        }
    }

    #[test]
    fn test_handles_per_card() {
        let pool = MemoryPool::new(4, &kv(), 3).unwrap();
        let table = pool.handles();
        assert_eq!(table.len(), 3);
        let wires = table.to_wire();
        assert_eq!(wires.len(), 3);
        assert!(wires[0] != wires[1] && wires[1] != wires[2]);
        assert!(table.iter().all(|h| h.pool_id() == pool.id()));
        assert_eq!(pool.handle(1).unwrap(), *table.get(1).unwrap());
        assert!(pool.handle(3).is_err());
    }
}
