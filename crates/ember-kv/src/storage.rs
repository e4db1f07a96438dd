//! Per-token cache vector storage backing one card of a memory pool

use ember_types::{DataType, EmberError, Result, SlotIndex};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Layout of a cache buffer: `slots × head_num × head_dim` elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvShape {
    pub slots: usize,
    pub head_num: usize,
    pub head_dim: usize,
    pub dtype: DataType,
}

impl KvShape {
    /// Elements in one token's cache vector
    pub fn vector_elems(&self) -> usize {
        self.head_num * self.head_dim
    }

    /// Bytes in one token's cache vector
    pub fn vector_bytes(&self) -> usize {
        self.vector_elems() * self.dtype.size_in_bytes()
    }

    /// Same per-token layout, ignoring slot count
    pub fn same_vector_layout(&self, other: &KvShape) -> bool {
        self.head_num == other.head_num
            && self.head_dim == other.head_dim
            && self.dtype == other.dtype
    }
}

/// Contiguous 3-D cache buffer (token × head × dim).
///
/// Each slot sits behind its own lock so that copy workers and the executor can
/// touch disjoint slots concurrently.
#[derive(Debug)]
pub struct KvStorage {
    shape: KvShape,
    slots: Vec<RwLock<Box<[u8]>>>,
}

impl KvStorage {
    pub fn new(shape: KvShape) -> Result<Self> {
        if shape.slots == 0 {
            return Err(EmberError::invalid_parameter("storage needs at least one slot"));
        }
        if shape.vector_elems() == 0 {
            return Err(EmberError::invalid_parameter(
                "head_num and head_dim must be positive",
            ));
        }
        let bytes = shape.vector_bytes();
        let slots = (0..shape.slots)
            .map(|_| RwLock::new(vec![0u8; bytes].into_boxed_slice()))
            .collect();
        Ok(Self { shape, slots })
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    pub fn slot_count(&self) -> usize {
        self.shape.slots
    }

    fn check_slot(&self, slot: SlotIndex) -> Result<usize> {
        let idx = slot as usize;
        if idx >= self.shape.slots {
            return Err(EmberError::malformed_request(format!(
                "slot {} out of range for storage of {} slots",
                slot, self.shape.slots
            )));
        }
        Ok(idx)
    }

    /// Copy out one token's full vector
    pub fn read_slot(&self, slot: SlotIndex) -> Result<Vec<u8>> {
        let idx = self.check_slot(slot)?;
        Ok(self.slots[idx].read().to_vec())
    }

    /// Overwrite one token's full vector
    pub fn write_slot(&self, slot: SlotIndex, data: &[u8]) -> Result<()> {
        let idx = self.check_slot(slot)?;
        if data.len() != self.shape.vector_bytes() {
            return Err(EmberError::malformed_request(format!(
                "vector of {} bytes does not match layout of {} bytes",
                data.len(),
                self.shape.vector_bytes()
            )));
        }
        self.slots[idx].write().copy_from_slice(data);
        Ok(())
    }

    /// Load `out.len()` bytes starting at `byte_offset` of a slot.
    ///
    /// Callers validate slot and range; out-of-range access panics.
    pub fn load_bytes(&self, slot: SlotIndex, byte_offset: usize, out: &mut [u8]) {
        let guard = self.slots[slot as usize].read();
        out.copy_from_slice(&guard[byte_offset..byte_offset + out.len()]);
    }

    /// Store `data` at `byte_offset` of a slot. Same contract as [`Self::load_bytes`].
    pub fn store_bytes(&self, slot: SlotIndex, byte_offset: usize, data: &[u8]) {
        let mut guard = self.slots[slot as usize].write();
        guard[byte_offset..byte_offset + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(slots: usize) -> KvShape {
        KvShape {
            slots,
            head_num: 2,
            head_dim: 3,
            dtype: DataType::FP16,
        }
    }

    #[test]
    fn test_vector_layout() {
        let s = shape(4);
        assert_eq!(s.vector_elems(), 6);
        assert_eq!(s.vector_bytes(), 12);
        assert!(s.same_vector_layout(&shape(10)));
    }

    #[test]
    fn test_slot_read_write() {
        let storage = KvStorage::new(shape(4)).unwrap();
        let data: Vec<u8> = (0..12).collect();
        storage.write_slot(2, &data).unwrap();
        assert_eq!(storage.read_slot(2).unwrap(), data);
        assert_eq!(storage.read_slot(1).unwrap(), vec![0u8; 12]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let storage = KvStorage::new(shape(4)).unwrap();
        assert!(storage.read_slot(4).is_err());
        assert!(storage.write_slot(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_partial_byte_access() {
        let storage = KvStorage::new(shape(1)).unwrap();
        storage.store_bytes(0, 4, &[9, 9]);
        let mut out = [0u8; 4];
        storage.load_bytes(0, 3, &mut out);
        assert_eq!(out, [0, 9, 9, 0]);
    }
}
