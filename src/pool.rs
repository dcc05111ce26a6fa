//! Slot-addressed page pool.
//!
//! Every published page buffer lives at a stable offset inside one
//! registered memory region so peers can fetch it with a single one-sided
//! read. The pool hands out fixed-size slots; the metadata ring exports each
//! slot's byte offset.

use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::rdma::MemoryRegion;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolSlot(u32);

pub struct PagePool {
    region: MemoryRegion,
    slot_size: usize,
    free: Mutex<Vec<u32>>,
    capacity: u32,
}

impl PagePool {
    pub fn new(slot_size: usize, capacity: u32) -> Self {
        assert!(slot_size > 0 && capacity > 0);
        let region = MemoryRegion::new(slot_size * capacity as usize);
        // Hand out low offsets first.
        let free = (0..capacity).rev().collect();
        PagePool {
            region,
            slot_size,
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn region(&self) -> MemoryRegion {
        self.region.clone()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.free.lock().len()
    }

    pub fn alloc(&self) -> Result<PoolSlot> {
        self.free
            .lock()
            .pop()
            .map(PoolSlot)
            .ok_or(CacheError::PoolExhausted)
    }

    pub fn release(&self, slot: PoolSlot) {
        debug_assert!(slot.0 < self.capacity);
        self.free.lock().push(slot.0);
    }

    pub fn offset(&self, slot: PoolSlot) -> u64 {
        slot.0 as u64 * self.slot_size as u64
    }

    /// Copies `data` into the slot's region bytes, padding the remainder of
    /// the slot with zeroes so remote readers always see a full block.
    pub fn publish(&self, slot: PoolSlot, data: &[u8]) -> Result<()> {
        if data.len() > self.slot_size {
            return Err(CacheError::InvalidArgument("page larger than pool slot"));
        }
        let offset = self.offset(slot);
        self.region.write_at(offset, data)?;
        if data.len() < self.slot_size {
            let pad = vec![0u8; self.slot_size - data.len()];
            self.region.write_at(offset + data.len() as u64, &pad)?;
        }
        Ok(())
    }
}
