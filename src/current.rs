//! Current-pages and the wait-queue pulse protocol.
//!
//! A current-page is the cache's live view of one block id: the acquirer
//! wait queue, the last write acquirer and its block version, keep-alives
//! from snapshotted readers, and the deletion flag. The pulse walk grants
//! readiness down the queue; it is idempotent, so any enqueue, dequeue or
//! state change may pulse freely.

use std::sync::Arc;

use crate::arena::define_handle;
use crate::cache::ShardState;
use crate::page::PageSlotId;
use crate::signal::Signal;
use crate::types::{BlockId, BlockVersion, Recency};
use crate::txn::TxnId;

define_handle!(CpId);
define_handle!(AcqId);

/// Which map a current-page lives in. `Detached` pages were served one-shot
/// from a remote peer without being admitted; they die with their last
/// acquirer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Realm {
    Primary,
    Write,
    Rdma,
    Detached,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

pub(crate) struct CurrentPage {
    pub(crate) block_id: BlockId,
    pub(crate) realm: Realm,
    pub(crate) page: Option<PageSlotId>,
    pub(crate) is_deleted: bool,
    pub(crate) last_write_acquirer: Option<TxnId>,
    /// Back-index into the last write acquirer's last-pages bag.
    pub(crate) last_writer_index: usize,
    pub(crate) last_write_version: BlockVersion,
    /// Acquirers in arrival order.
    pub(crate) queue: Vec<AcqId>,
    /// Snapshotted readers holding the current-page alive.
    pub(crate) keepalives: u32,
}

impl CurrentPage {
    pub(crate) fn new(block_id: BlockId, realm: Realm, page: Option<PageSlotId>) -> CurrentPage {
        CurrentPage {
            block_id,
            realm,
            page,
            is_deleted: false,
            last_write_acquirer: None,
            last_writer_index: 0,
            // Version zero stays reserved for "unassigned".
            last_write_version: BlockVersion::FIRST,
            queue: Vec::new(),
            keepalives: 0,
        }
    }
}

/// A snapshotted reader's captured view: the page at capture time (absent
/// when the block was deleted) and the recency it saw.
pub(crate) struct PageSnapshot {
    pub(crate) page: Option<PageSlotId>,
    pub(crate) recency: Recency,
}

pub(crate) struct AcquirerState {
    pub(crate) block_id: BlockId,
    pub(crate) cp: CpId,
    /// Write acquirers belong to a transaction; read acquirers stand alone.
    pub(crate) txn: Option<TxnId>,
    pub(crate) access: Access,
    pub(crate) declared_snapshotted: bool,
    pub(crate) read_signal: Arc<Signal>,
    pub(crate) write_signal: Arc<Signal>,
    pub(crate) block_version: BlockVersion,
    pub(crate) dirtied: bool,
    pub(crate) touched: bool,
    pub(crate) snapshot: Option<PageSnapshot>,
}

impl AcquirerState {
    pub(crate) fn new(block_id: BlockId, cp: CpId, txn: Option<TxnId>, access: Access) -> Self {
        debug_assert!(access == Access::Write || txn.is_none());
        AcquirerState {
            block_id,
            cp,
            txn,
            access,
            declared_snapshotted: false,
            read_signal: Arc::new(Signal::new()),
            write_signal: Arc::new(Signal::new()),
            block_version: BlockVersion::ZERO,
            dirtied: false,
            touched: false,
            snapshot: None,
        }
    }
}

impl ShardState {
    /// Enqueues an acquirer. Write acquirers take the successor block
    /// version and (re)link the page to their transaction's last-pages bag,
    /// chaining the previous last writer in as a preceder.
    pub(crate) fn cp_add_acquirer(&mut self, cp_id: CpId, acq_id: AcqId) {
        let prev_version = self.cps.get(cp_id).last_write_version;
        let access = self.acqs.get(acq_id).access;
        if access == Access::Write {
            let version = prev_version.next();
            self.acqs.get_mut(acq_id).block_version = version;
            let txn_id = self
                .acqs
                .get(acq_id)
                .txn
                .expect("write acquirer without a transaction");
            self.cps.get_mut(cp_id).last_write_version = version;

            if self.cps.get(cp_id).last_write_acquirer != Some(txn_id) {
                if let Some(prev_writer) = self.cps.get(cp_id).last_write_acquirer {
                    self.last_pages_remove(prev_writer, cp_id);
                    self.connect_preceder(txn_id, prev_writer);
                }
                let txn = self.txns.get_mut(txn_id);
                self.cps.get_mut(cp_id).last_writer_index = txn.pages_write_acquired_last.len();
                txn.pages_write_acquired_last.push(cp_id);
                self.cps.get_mut(cp_id).last_write_acquirer = Some(txn_id);
            }
        } else {
            self.acqs.get_mut(acq_id).block_version = prev_version;
        }
        self.cps.get_mut(cp_id).queue.push(acq_id);
        self.pulse_pulsables(cp_id, acq_id);
    }

    /// Dequeues an acquirer and pulses its successor.
    pub(crate) fn cp_remove_acquirer(&mut self, cp_id: CpId, acq_id: AcqId) {
        let position = self
            .cps
            .get(cp_id)
            .queue
            .iter()
            .position(|&a| a == acq_id)
            .expect("acquirer not in queue");
        self.cps.get_mut(cp_id).queue.remove(position);
        let next = self.cps.get(cp_id).queue.get(position).copied();
        if let Some(next) = next {
            self.pulse_pulsables(cp_id, next);
        }
    }

    /// Walks the queue from `start`, granting readiness: consecutive
    /// readers get read-availability; snapshotted readers capture the live
    /// page and leave the queue; the first writer gets read-availability,
    /// plus write-availability if nothing precedes it, and ends the walk.
    pub(crate) fn pulse_pulsables(&mut self, cp_id: CpId, start: AcqId) {
        let position = match self.cps.get(cp_id).queue.iter().position(|&a| a == start) {
            Some(position) => position,
            None => return,
        };

        // Nothing to do until the predecessor is a granted reader.
        if position > 0 {
            let prev = self.cps.get(cp_id).queue[position - 1];
            let prev_acq = self.acqs.get(prev);
            if !(prev_acq.access == Access::Read && prev_acq.read_signal.is_pulsed()) {
                return;
            }
        }

        // Already-pulsed reader chains don't need re-walking unless the
        // start is snapshotted (it still wants to detach) or the successor
        // has yet to be granted.
        {
            let acq = self.acqs.get(start);
            if acq.access == Access::Read
                && acq.read_signal.is_pulsed()
                && !acq.declared_snapshotted
            {
                match self.cps.get(cp_id).queue.get(position + 1) {
                    None => return,
                    Some(&next) => {
                        if self.acqs.get(next).read_signal.is_pulsed() {
                            return;
                        }
                    }
                }
            }
        }

        let block_id = self.cps.get(cp_id).block_id;
        let current_recency = self.recency_for_block(block_id);

        let mut index = position;
        loop {
            let current = match self.cps.get(cp_id).queue.get(index) {
                Some(&acq) => acq,
                None => break,
            };
            self.acqs.get(current).read_signal.pulse();

            if self.acqs.get(current).access == Access::Read {
                if self.acqs.get(current).declared_snapshotted {
                    // Snapshotters leave the queue so writers behind them
                    // can make progress; they capture the live page first.
                    let page = self.page_for_read_or_deleted(cp_id);
                    if let Some(page) = page {
                        self.page_ref(page);
                    }
                    self.acqs.get_mut(current).snapshot = Some(PageSnapshot {
                        page,
                        recency: current_recency,
                    });
                    self.cps.get_mut(cp_id).queue.remove(index);
                    // The next acquirer shifted into `index`.
                } else {
                    index += 1;
                }
            } else {
                if index == 0 {
                    assert!(
                        !self.cps.get(cp_id).is_deleted,
                        "write granted on a deleted block"
                    );
                    self.acqs.get(current).write_signal.pulse();
                }
                break;
            }
        }
    }

    /// Downgrades a write acquirer to read-only and re-pulses from it.
    pub(crate) fn declare_readonly(&mut self, acq_id: AcqId) {
        let cp_id = self.acqs.get(acq_id).cp;
        self.acqs.get_mut(acq_id).access = Access::Read;
        self.pulse_pulsables(cp_id, acq_id);
    }

    /// Marks a reader snapshotted: it takes a keep-alive on the
    /// current-page and the next pulse detaches it with a captured page.
    pub(crate) fn declare_snapshotted(&mut self, acq_id: AcqId) {
        let acq = self.acqs.get(acq_id);
        assert!(acq.access == Access::Read, "only readers snapshot");
        if self.acqs.get(acq_id).declared_snapshotted {
            return;
        }
        let cp_id = self.acqs.get(acq_id).cp;
        self.acqs.get_mut(acq_id).declared_snapshotted = true;
        self.cps.get_mut(cp_id).keepalives += 1;
        self.pulse_pulsables(cp_id, acq_id);
    }

    /// Deletes the block. Only the exclusive write acquirer may call this;
    /// it is the sole queue entry at that moment.
    pub(crate) fn cp_mark_deleted(&mut self, cp_id: CpId) {
        let cp = self.cps.get(cp_id);
        assert!(!cp.is_deleted);
        assert_eq!(
            cp.queue.len(),
            1,
            "deletion requires the exclusive write acquirer"
        );
        let block_id = cp.block_id;
        self.cps.get_mut(cp_id).is_deleted = true;
        self.set_recency_for_block(block_id, Recency::INVALID);
        if let Some(page) = self.cps.get_mut(cp_id).page.take() {
            self.page_unref(page);
        }
    }

    /// The live page for a snapshot capture, or `None` when deleted. A
    /// write acquirer that deleted the block learns of it this way when it
    /// downgrades to flush its version.
    pub(crate) fn page_for_read_or_deleted(&mut self, cp_id: CpId) -> Option<PageSlotId> {
        if self.cps.get(cp_id).is_deleted {
            None
        } else {
            Some(self.ensure_page(cp_id, true))
        }
    }

    /// Whether the current-page can be wiped: nobody is queued on it,
    /// nothing links to it, and its page (if any) is an unloaded husk with
    /// only our own reference.
    pub(crate) fn should_be_evicted(&self, cp_id: CpId) -> bool {
        let cp = self.cps.get(cp_id);
        if !cp.queue.is_empty() {
            return false;
        }
        if cp.last_write_acquirer.is_some() {
            return false;
        }
        if cp.keepalives > 0 {
            return false;
        }
        if let Some(page) = cp.page {
            let page = self.pages.get(page);
            if page.is_loading() || page.has_waiters() || page.is_loaded() || page.ptr_count != 1 {
                return false;
            }
        }
        true
    }
}
