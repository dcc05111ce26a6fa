//! The in-memory representation of one block's contents.
//!
//! A page is owned by its current-page and reference-counted: snapshotted
//! readers and dirty-page records hold extra references that keep the bytes
//! (or at least the block token) alive past the current-page's interest.

use std::sync::Arc;

use crate::arena::define_handle;
use crate::pool::PoolSlot;
use crate::serializer::BlockToken;
use crate::signal::Signal;
use crate::types::BlockId;

define_handle!(
    /// Handle into the shard's page arena.
    PageSlotId
);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LoadState {
    /// Constructed, no load attempted.
    NotLoaded,
    /// A serializer read is in flight.
    Loading,
    /// Constructed for a snapshotted reader; the load happens when someone
    /// actually looks at the bytes.
    DeferredLoading,
    Loaded,
    /// Buffer dropped; the block token remains for reloading.
    Evicted,
}

/// The five eviction categories. A page is in exactly one bag (or none,
/// transiently, while being reclassified).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BagKind {
    Unevictable,
    EvictableDiskBacked,
    EvictableUnbacked,
    Evicted,
    Rdma,
}

pub(crate) const BAG_COUNT: usize = 5;

impl BagKind {
    pub(crate) fn index(self) -> usize {
        match self {
            BagKind::Unevictable => 0,
            BagKind::EvictableDiskBacked => 1,
            BagKind::EvictableUnbacked => 2,
            BagKind::Evicted => 3,
            BagKind::Rdma => 4,
        }
    }

    pub(crate) const ALL: [BagKind; BAG_COUNT] = [
        BagKind::Unevictable,
        BagKind::EvictableDiskBacked,
        BagKind::EvictableUnbacked,
        BagKind::Evicted,
        BagKind::Rdma,
    ];
}

pub(crate) struct PageBuf {
    /// Pool slot whose region bytes mirror `data`, when the pool had room.
    /// Only slotted pages are discoverable by peers.
    pub(crate) slot: Option<PoolSlot>,
    pub(crate) data: Box<[u8]>,
}

pub(crate) struct Page {
    pub(crate) block_id: BlockId,
    pub(crate) block_size: u32,
    pub(crate) state: LoadState,
    pub(crate) buf: Option<PageBuf>,
    pub(crate) token: Option<BlockToken>,
    /// References from the owning current-page, snapshotted readers, and
    /// dirty-page records.
    pub(crate) ptr_count: u32,
    /// Threads blocked on the in-flight load.
    pub(crate) load_waiters: u32,
    pub(crate) load_signal: Option<Arc<Signal>>,
    pub(crate) is_rdma: bool,
    /// Created by a write transaction, as opposed to loaded from somewhere.
    pub(crate) is_write: bool,
    pub(crate) access_time: u64,
    pub(crate) bag: Option<BagKind>,
    pub(crate) bag_index: usize,
}

impl Page {
    pub(crate) fn new(block_id: BlockId, block_size: u32, state: LoadState) -> Page {
        Page {
            block_id,
            block_size,
            state,
            buf: None,
            token: None,
            ptr_count: 0,
            load_waiters: 0,
            load_signal: None,
            is_rdma: false,
            is_write: false,
            access_time: 0,
            bag: None,
            bag_index: 0,
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    pub(crate) fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.load_waiters > 0
    }

    /// Disk-backed means the serializer holds a copy we could reload; that
    /// is exactly "we have a block token".
    pub(crate) fn is_disk_backed(&self) -> bool {
        self.token.is_some()
    }

    /// The memory this page occupies when loaded. Bag byte counters track
    /// the hypothetical figure so classification changes don't change
    /// totals.
    pub(crate) fn hypothetical_memory_usage(&self) -> u64 {
        self.block_size as u64
    }

    pub(crate) fn debug_invariants(&self) {
        if self.is_loaded() {
            debug_assert!(self.buf.is_some(), "loaded page without buffer");
            if let Some(buf) = &self.buf {
                debug_assert_eq!(buf.data.len(), self.block_size as usize);
            }
        }
        if self.state == LoadState::Evicted {
            debug_assert!(self.buf.is_none(), "evicted page still holds bytes");
            debug_assert!(self.token.is_some(), "evicted page without token");
        }
        if self.is_rdma {
            debug_assert_ne!(self.bag, Some(BagKind::EvictableDiskBacked));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_backed_tracks_token() {
        let mut page = Page::new(BlockId(1), 4096, LoadState::NotLoaded);
        assert!(!page.is_disk_backed());
        page.token = Some(BlockToken(9));
        assert!(page.is_disk_backed());
        assert_eq!(page.hypothetical_memory_usage(), 4096);
    }

    #[test]
    fn bag_indices_cover_all_bags() {
        let mut seen = [false; BAG_COUNT];
        for kind in BagKind::ALL {
            seen[kind.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
