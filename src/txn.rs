//! Write transactions and the flush-order DAG.
//!
//! Transactions exist to reach disk: every block a transaction modified
//! must land in one index write, and if S modified a block before T did (or
//! S preceded T on the same connection), S flushes before or together with
//! T. The DAG lives in handle vectors: `preceders` and `subseqers` mirror
//! each other exactly.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::acquirer::PageAcquirer;
use crate::arena::define_handle;
use crate::cache::{PageCache, ShardState};
use crate::current::{Access, AcqId, CpId};
use crate::error::Result;
use crate::page::PageSlotId;
use crate::signal::Signal;
use crate::throttler::ThrottlerAcq;
use crate::types::{BlockId, BlockType, BlockVersion, Recency};

define_handle!(TxnId);
define_handle!(ConnId);

/// Tri-color mark used while computing a maximal flushable set. `NotMarked`
/// except inside the walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Mark {
    NotMarked,
    Blue,
    Green,
    Red,
}

/// A dirtied-block record: the snapshotted page value (absent for a
/// deletion) at the version the transaction wrote.
pub(crate) struct DirtiedPage {
    pub(crate) block_version: BlockVersion,
    pub(crate) block_id: BlockId,
    pub(crate) page: Option<PageSlotId>,
    pub(crate) recency: Recency,
}

/// A touched-block record: only the recency moved.
pub(crate) struct TouchedPage {
    pub(crate) block_version: BlockVersion,
    pub(crate) block_id: BlockId,
    pub(crate) recency: Recency,
}

pub(crate) struct Transaction {
    pub(crate) conn: Option<ConnId>,
    pub(crate) throttler_acq: Option<ThrottlerAcq>,
    /// Transactions that must flush before or together with this one.
    pub(crate) preceders: SmallVec<[TxnId; 4]>,
    /// Transactions this one must flush before or together with.
    pub(crate) subseqers: SmallVec<[TxnId; 4]>,
    /// Pages whose last write acquirer is this transaction; each page holds
    /// a back-index into this vector.
    pub(crate) pages_write_acquired_last: Vec<CpId>,
    pub(crate) live_acqs: usize,
    pub(crate) dirtied: Vec<DirtiedPage>,
    pub(crate) touched: Vec<TouchedPage>,
    pub(crate) began_waiting_for_flush: bool,
    pub(crate) spawned_flush: bool,
    pub(crate) mark: Mark,
    pub(crate) flush_complete: Arc<Signal>,
}

impl Transaction {
    pub(crate) fn new(throttler_acq: Option<ThrottlerAcq>) -> Transaction {
        Transaction {
            conn: None,
            throttler_acq,
            preceders: SmallVec::new(),
            subseqers: SmallVec::new(),
            pages_write_acquired_last: Vec::new(),
            live_acqs: 0,
            dirtied: Vec::new(),
            touched: Vec::new(),
            began_waiting_for_flush: false,
            spawned_flush: false,
            mark: Mark::NotMarked,
            flush_complete: Arc::new(Signal::new()),
        }
    }
}

pub(crate) struct ConnectionState {
    pub(crate) newest_txn: Option<TxnId>,
}

impl ShardState {
    /// Adds `preceder` before `txn`, deduplicating. Adjacency lists are a
    /// chain per block or connection in practice, so the linear scan is
    /// fine.
    pub(crate) fn connect_preceder(&mut self, txn_id: TxnId, preceder: TxnId) {
        assert_ne!(txn_id, preceder, "a transaction cannot precede itself");
        assert!(
            !self.txns.get(preceder).flush_complete.is_pulsed(),
            "preceder already left the graph"
        );
        if !self.txns.get(txn_id).preceders.contains(&preceder) {
            self.txns.get_mut(txn_id).preceders.push(preceder);
            self.txns.get_mut(preceder).subseqers.push(txn_id);
        }
    }

    pub(crate) fn remove_preceder(&mut self, txn_id: TxnId, preceder: TxnId) {
        let preceders = &mut self.txns.get_mut(txn_id).preceders;
        let position = preceders
            .iter()
            .position(|&t| t == preceder)
            .expect("preceder not linked");
        preceders.remove(position);
    }

    pub(crate) fn remove_subseqer(&mut self, txn_id: TxnId, subseqer: TxnId) {
        let subseqers = &mut self.txns.get_mut(txn_id).subseqers;
        let position = subseqers
            .iter()
            .position(|&t| t == subseqer)
            .expect("subseqer not linked");
        subseqers.remove(position);
    }

    /// Unlinks one page from a transaction's last-pages bag via the page's
    /// back-index, fixing up the element swapped into its place.
    pub(crate) fn last_pages_remove(&mut self, txn_id: TxnId, cp_id: CpId) {
        let index = self.cps.get(cp_id).last_writer_index;
        let bag = &mut self.txns.get_mut(txn_id).pages_write_acquired_last;
        debug_assert_eq!(bag[index], cp_id);
        bag.swap_remove(index);
        if index < bag.len() {
            let moved = bag[index];
            self.cps.get_mut(moved).last_writer_index = index;
        }
    }

    pub(crate) fn txn_add_acquirer(&mut self, txn_id: TxnId, acq_id: AcqId) {
        debug_assert_eq!(self.acqs.get(acq_id).access, Access::Write);
        self.txns.get_mut(txn_id).live_acqs += 1;
    }

    /// Detaches a write acquirer from its transaction, folding its effect
    /// into the dirtied or touched record list. A dirtying acquirer is
    /// downgraded to a snapshotted reader so the transaction keeps the
    /// exact page value it wrote.
    pub(crate) fn txn_remove_acquirer(&mut self, txn_id: TxnId, acq_id: AcqId) {
        assert_eq!(
            self.acqs.get(acq_id).access,
            Access::Write,
            "only write acquirers belong to transactions"
        );
        {
            let txn = self.txns.get_mut(txn_id);
            assert!(txn.live_acqs > 0, "acquirer outlives its transaction");
            txn.live_acqs -= 1;
        }

        let block_id = self.acqs.get(acq_id).block_id;
        let block_version = self.acqs.get(acq_id).block_version;

        if self.acqs.get(acq_id).dirtied {
            assert!(
                self.acqs.get(acq_id).write_signal.is_pulsed(),
                "dirtied without exclusive write access"
            );
            // Downgrade and snapshot: the captured page is the value this
            // transaction will flush. Duplicate records per block are fine;
            // change compaction keeps the newest version.
            self.declare_readonly(acq_id);
            self.declare_snapshotted(acq_id);
            let snapshot = self
                .acqs
                .get_mut(acq_id)
                .snapshot
                .take()
                .expect("snapshot captured synchronously at queue head");
            let txn = self.txns.get_mut(txn_id);
            txn.dirtied.push(DirtiedPage {
                block_version,
                block_id,
                page: snapshot.page,
                recency: snapshot.recency,
            });
            let dirty_count = txn.dirtied.len() as i64;
            if let Some(acq) = txn.throttler_acq.as_mut() {
                acq.update_dirty_page_count(dirty_count);
            }
        } else if self.acqs.get(acq_id).touched {
            let recency = self.recency_for_block(block_id);
            self.txns.get_mut(txn_id).touched.push(TouchedPage {
                block_version,
                block_id,
                recency,
            });
        }
    }

    /// Final teardown after the flush has pulsed (or for read transactions,
    /// immediately). The graph links must already be gone.
    pub(crate) fn destroy_txn(&mut self, txn_id: TxnId) {
        let txn = self.txns.remove(txn_id);
        assert!(txn.flush_complete.is_pulsed());
        assert!(txn.preceders.is_empty());
        assert!(txn.subseqers.is_empty());
        assert!(txn.dirtied.is_empty());
        assert!(txn.pages_write_acquired_last.is_empty());
        // Dropping the throttler lease returns the index half.
        drop(txn);
    }
}

/// A serialization context for one client session. The newest unflushed
/// transaction on the connection becomes a preceder of the next one, so a
/// session's writes flush in order.
pub struct CacheConnection {
    cache: Arc<PageCache>,
    pub(crate) id: ConnId,
}

impl CacheConnection {
    pub fn new(cache: &Arc<PageCache>) -> CacheConnection {
        let id = cache.register_connection();
        CacheConnection {
            cache: Arc::clone(cache),
            id,
        }
    }
}

impl Drop for CacheConnection {
    fn drop(&mut self) {
        self.cache.unregister_connection(self.id);
    }
}

/// A write transaction handle. Acquire pages through it, then hand it back
/// to the cache via [`PageCache::flush_and_destroy_txn`] (or
/// [`PageCache::end_read_txn`] if it never wrote).
pub struct PageTxn {
    pub(crate) cache: Arc<PageCache>,
    pub(crate) id: TxnId,
    pub(crate) finished: bool,
}

impl PageTxn {
    /// Acquires an existing block. Reads do not join the transaction's
    /// acquirer set; they only observe versions.
    pub fn acquire(&self, block_id: BlockId, access: Access) -> Result<PageAcquirer> {
        match access {
            Access::Write => self.cache.write_acquire(self.id, block_id),
            Access::Read => self.cache.read_acquire(block_id),
        }
    }

    /// Creates a new block with a freshly allocated id.
    pub fn create(&self, block_type: BlockType) -> Result<PageAcquirer> {
        self.cache.create_block(self.id, block_type)
    }

    /// Creates a block under a caller-chosen id.
    pub fn create_chosen(&self, block_id: BlockId) -> Result<PageAcquirer> {
        self.cache.create_chosen_block(self.id, block_id)
    }
}

impl Drop for PageTxn {
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() {
            return;
        }
        // A transaction that never wrote can die quietly; one with changes
        // must be flushed explicitly.
        self.cache.abandon_txn(self.id);
    }
}

/// Awaitable flush completion for one transaction.
pub struct FlushHandle {
    pub(crate) signal: Arc<Signal>,
}

impl FlushHandle {
    pub fn wait(&self) {
        self.signal.wait();
    }

    pub fn is_complete(&self) -> bool {
        self.signal.is_pulsed()
    }

    /// Returns false on timeout. Flush failures leave the handle unpulsed
    /// forever; persistence failures are recovered outside the cache.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }
}
