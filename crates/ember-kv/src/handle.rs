//! Memory handles: the only form in which a pool's storage crosses the transfer boundary

use crate::storage::{KvShape, KvStorage};
use ember_types::{EmberError, PoolId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reference to one card's cache buffer.
///
/// Produced only by [`crate::MemoryPool`]. The wire form is the buffer's base
/// address; it is resolved back through a [`HandleRegistry`].
#[derive(Clone)]
pub struct MemoryHandle {
    pool: PoolId,
    card: usize,
    base: u64,
    stride: usize,
    storage: Arc<KvStorage>,
}

impl MemoryHandle {
    pub(crate) fn new(pool: PoolId, card: usize, storage: Arc<KvStorage>) -> Self {
        let base = Arc::as_ptr(&storage) as usize as u64;
        let stride = storage.shape().vector_bytes();
        Self {
            pool,
            card,
            base,
            stride,
            storage,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    pub fn card(&self) -> usize {
        self.card
    }

    /// Bytes between consecutive token vectors
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn shape(&self) -> KvShape {
        self.storage.shape()
    }

    pub fn storage(&self) -> &KvStorage {
        &self.storage
    }

    /// Raw 64-bit representation handed to the copy layer
    pub fn wire(&self) -> u64 {
        self.base
    }
}

impl PartialEq for MemoryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.pool == other.pool
    }
}

impl Eq for MemoryHandle {}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("pool", &self.pool)
            .field("card", &self.card)
            .field("base", &format_args!("{:#x}", self.base))
            .field("stride", &self.stride)
            .finish()
    }
}

/// Ordered table of handles, one per shard or per (shard, card)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleTable {
    handles: Vec<MemoryHandle>,
}

impl HandleTable {
    pub fn new(handles: Vec<MemoryHandle>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MemoryHandle> {
        self.handles.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryHandle> {
        self.handles.iter()
    }

    pub fn push(&mut self, handle: MemoryHandle) {
        self.handles.push(handle);
    }

    /// Plain address array as exchanged between processes
    pub fn to_wire(&self) -> Vec<u64> {
        self.handles.iter().map(MemoryHandle::wire).collect()
    }

    /// Resolve a wire address array; unknown addresses are rejected
    pub fn from_wire(wire: &[u64], registry: &HandleRegistry) -> Result<Self> {
        let handles = wire
            .iter()
            .map(|&addr| registry.resolve(addr))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { handles })
    }
}

impl FromIterator<MemoryHandle> for HandleTable {
    fn from_iter<I: IntoIterator<Item = MemoryHandle>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Address book of handles known to this process
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: RwLock<HashMap<u64, MemoryHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: &MemoryHandle) {
        self.handles.write().insert(handle.wire(), handle.clone());
    }

    pub fn register_all<'a>(&self, handles: impl IntoIterator<Item = &'a MemoryHandle>) {
        let mut map = self.handles.write();
        for handle in handles {
            map.insert(handle.wire(), handle.clone());
        }
    }

    pub fn resolve(&self, wire: u64) -> Result<MemoryHandle> {
        self.handles.read().get(&wire).cloned().ok_or_else(|| {
            EmberError::transfer_shape_mismatch(format!("unknown memory handle {:#x}", wire))
        })
    }

    pub fn unregister_pool(&self, pool: PoolId) {
        self.handles.write().retain(|_, h| h.pool_id() != pool);
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}
