//! The acquirer handle: a transaction's (or standalone reader's) scoped
//! claim on one current-page.
//!
//! Readiness is two pulse-once signals. Waiting happens without the shard
//! lock; every accessor waits for the right signal before touching the
//! page. Dropping the handle releases on every exit path: dirty and
//! touched records transfer to the transaction and the queue successor is
//! pulsed.

use std::sync::Arc;

use crate::cache::PageCache;
use crate::current::{Access, AcqId};
use crate::error::Result;
use crate::signal::Signal;
use crate::types::{BlockId, BlockVersion, Recency};

pub struct PageAcquirer {
    cache: Arc<PageCache>,
    id: AcqId,
    block_id: BlockId,
    access: Access,
    read_signal: Arc<Signal>,
    write_signal: Arc<Signal>,
}

impl PageAcquirer {
    pub(crate) fn new(
        cache: Arc<PageCache>,
        id: AcqId,
        block_id: BlockId,
        access: Access,
        read_signal: Arc<Signal>,
        write_signal: Arc<Signal>,
    ) -> PageAcquirer {
        PageAcquirer {
            cache,
            id,
            block_id,
            access,
            read_signal,
            write_signal,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// The block version this acquisition observed (readers) or issued
    /// (writers).
    pub fn block_version(&self) -> BlockVersion {
        self.cache.acq_block_version(self.id)
    }

    /// Blocks until read availability has been pulsed.
    pub fn wait_read(&self) {
        self.read_signal.wait();
    }

    /// Blocks until exclusive write availability has been pulsed.
    pub fn wait_write(&self) {
        assert_eq!(self.access, Access::Write, "read acquirer cannot write");
        self.write_signal.wait();
    }

    pub fn read_available(&self) -> bool {
        self.read_signal.is_pulsed()
    }

    pub fn write_available(&self) -> bool {
        self.write_signal.is_pulsed()
    }

    /// Runs `f` over the block's bytes, loading them from a peer-captured
    /// snapshot, the serializer, or memory as needed.
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.wait_read();
        self.cache.with_page_bytes(self.id, f)
    }

    /// Runs `f` over the block's writable bytes and marks the page
    /// dirtied. Requires (and waits for) exclusive write availability.
    pub fn write_with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.wait_write();
        self.cache.with_page_bytes_mut(self.id, f)
    }

    /// The block's recency, from the snapshot if one was captured.
    pub fn recency(&self) -> Recency {
        match self.access {
            Access::Read => self.wait_read(),
            Access::Write => self.wait_write(),
        }
        self.cache.acq_recency(self.id)
    }

    /// Sets the block's recency and marks the page touched.
    pub fn set_recency(&self, recency: Recency) {
        self.wait_write();
        self.cache.acq_set_recency(self.id, recency);
    }

    /// Deletes the block. Requires exclusive write availability; the
    /// caller is the sole acquirer at that moment.
    pub fn mark_deleted(&self) {
        self.wait_write();
        self.cache.acq_mark_deleted(self.id);
    }

    /// Declares this reader snapshotted: it captures the page version it
    /// sees and stops blocking writers behind it in the queue.
    pub fn declare_snapshotted(&self) {
        assert_eq!(self.access, Access::Read, "only readers snapshot");
        self.cache.acq_declare_snapshotted(self.id);
    }
}

impl Drop for PageAcquirer {
    fn drop(&mut self) {
        self.cache.acq_release(self.id);
    }
}
