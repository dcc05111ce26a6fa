//! Dirty-page throttling.
//!
//! Write transactions hold a lease against two counting semaphores: one for
//! in-memory block changes, one for pending index changes. The lease grows
//! monotonically as the transaction dirties pages (it may overdraw rather
//! than block mid-transaction), the block half is returned as soon as the
//! flush has written the blocks, and the index half when the lease drops.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub struct TxnThrottler {
    inner: Mutex<ThrottlerInner>,
    cv: Condvar,
}

struct ThrottlerInner {
    block_available: i64,
    index_available: i64,
    capacity: i64,
}

impl TxnThrottler {
    pub fn new(capacity: i64) -> Arc<TxnThrottler> {
        let capacity = capacity.max(1);
        Arc::new(TxnThrottler {
            inner: Mutex::new(ThrottlerInner {
                block_available: capacity,
                index_available: capacity,
                capacity,
            }),
            cv: Condvar::new(),
        })
    }

    /// Adjusts capacity when the memory limit moves. Outstanding leases are
    /// untouched; the delta is applied to what is available.
    pub fn inform_memory_limit_change(&self, memory_limit: u64, max_block_size: u32) {
        let new_capacity = ((memory_limit / max_block_size.max(1) as u64) as i64).max(1);
        let mut inner = self.inner.lock();
        let delta = new_capacity - inner.capacity;
        inner.capacity = new_capacity;
        inner.block_available += delta;
        inner.index_available += delta;
        if delta > 0 {
            self.cv.notify_all();
        }
    }

    /// Gets in line for one unit of each semaphore, blocking while either is
    /// exhausted. The returned lease grows later via
    /// [`ThrottlerAcq::update_dirty_page_count`].
    pub fn begin_txn_acq(self: &Arc<Self>) -> ThrottlerAcq {
        let mut inner = self.inner.lock();
        while inner.block_available <= 0 || inner.index_available <= 0 {
            self.cv.wait(&mut inner);
        }
        inner.block_available -= 1;
        inner.index_available -= 1;
        ThrottlerAcq {
            throttler: Arc::clone(self),
            block_held: 1,
            index_held: 1,
        }
    }

    pub fn available(&self) -> (i64, i64) {
        let inner = self.inner.lock();
        (inner.block_available, inner.index_available)
    }

    fn release(&self, block: i64, index: i64) {
        if block == 0 && index == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.block_available += block;
        inner.index_available += index;
        self.cv.notify_all();
    }

    fn grow(&self, block_delta: i64, index_delta: i64) {
        let mut inner = self.inner.lock();
        // Growth never blocks; a transaction half-way through its writes
        // must be allowed to finish, so the semaphores may go negative.
        inner.block_available -= block_delta;
        inner.index_available -= index_delta;
    }
}

/// A transaction's lease on the throttler.
pub struct ThrottlerAcq {
    throttler: Arc<TxnThrottler>,
    block_held: i64,
    index_held: i64,
}

impl ThrottlerAcq {
    /// Raises the lease to cover `new_count` dirty pages. The count is a
    /// monotonic upper bound; calls with a smaller count are no-ops.
    pub fn update_dirty_page_count(&mut self, new_count: i64) {
        debug_assert_eq!(self.block_held, self.index_held);
        if new_count > self.block_held {
            let delta = new_count - self.block_held;
            self.throttler.grow(delta, delta);
            self.block_held += delta;
            self.index_held += delta;
        }
    }

    /// Returns the block half of the lease once the flush has written the
    /// dirty blocks; the index half stays until the lease drops.
    pub fn mark_dirty_pages_written(&mut self) {
        let block = std::mem::take(&mut self.block_held);
        self.throttler.release(block, 0);
    }
}

impl Drop for ThrottlerAcq {
    fn drop(&mut self) {
        let block = std::mem::take(&mut self.block_held);
        let index = std::mem::take(&mut self.index_held);
        self.throttler.release(block, index);
    }
}
