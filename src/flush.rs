//! Flush scheduling: maximal flushable sets, change compaction, and the
//! serializer-side worker.
//!
//! Transactions flush in topological order over the happens-before DAG;
//! mutually dependent sets flush together in one index write. The worker
//! consumes jobs over a FIFO channel, so index writes reach the serializer
//! in exactly the order the shard issued them.

use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::cache::ShardState;
use crate::current::{Access, Realm};
use crate::page::PageSlotId;
use crate::serializer::{BlockToken, BlockWrite, IndexWriteOp, IoAccount, Serializer};
use crate::txn::{Mark, TxnId};
use crate::types::{superceding_recency, BlockId, BlockVersion, Recency};

/// One compacted change for a block: the newest version across the flush
/// set wins. `page` is absent for deletions.
pub(crate) struct BlockChange {
    pub(crate) version: BlockVersion,
    pub(crate) modified: bool,
    pub(crate) page: Option<PageSlotId>,
    pub(crate) recency: Recency,
}

pub(crate) struct PendingWrite {
    pub(crate) block_id: BlockId,
    pub(crate) data: Vec<u8>,
    pub(crate) slot: PageSlotId,
    pub(crate) recency: Recency,
}

/// Everything the worker needs to persist one flush set. Block bytes are
/// copied at build time, under the shard lock, so later writers cannot
/// change what this flush persists.
pub(crate) struct FlushJob {
    pub(crate) txns: Vec<TxnId>,
    pub(crate) deletions: Vec<BlockId>,
    pub(crate) tokened: Vec<(BlockId, BlockToken, Recency)>,
    pub(crate) writes: Vec<PendingWrite>,
    pub(crate) touched: Vec<(BlockId, Recency)>,
}

/// Computes the set of transactions that can flush together, given a base
/// transaction that just announced waiting-for-flush.
///
/// Marks move through four colors: not-considered, blue (queued), green
/// (flushable so far), red (unflushable). A preceder that already spawned
/// its flush counts as absent; one that has not announced, or is red,
/// poisons the transaction. Discovering a red transaction re-opens its
/// already-green subseqers, so each transaction is visited at most twice.
pub(crate) fn maximal_flushable_txn_set(state: &mut ShardState, base: TxnId) -> Vec<TxnId> {
    debug_assert!(!state.txns.get(base).spawned_flush);
    debug_assert!(state.txns.get(base).began_waiting_for_flush);
    debug_assert_eq!(state.txns.get(base).mark, Mark::NotMarked);

    let mut blue: Vec<TxnId> = Vec::new();
    let mut colored: Vec<TxnId> = Vec::new();
    state.txns.get_mut(base).mark = Mark::Blue;
    blue.push(base);
    colored.push(base);

    while let Some(txn_id) = blue.pop() {
        debug_assert!(!state.txns.get(txn_id).spawned_flush);
        debug_assert!(state.txns.get(txn_id).began_waiting_for_flush);
        debug_assert_eq!(state.txns.get(txn_id).mark, Mark::Blue);

        let mut poisoned = false;
        let preceders: Vec<TxnId> = state.txns.get(txn_id).preceders.to_vec();
        for preceder in preceders {
            let (spawned, began, mark) = {
                let txn = state.txns.get(preceder);
                (txn.spawned_flush, txn.began_waiting_for_flush, txn.mark)
            };
            if spawned {
                debug_assert_eq!(mark, Mark::NotMarked);
            } else if !began || mark == Mark::Red {
                poisoned = true;
            } else if mark == Mark::NotMarked {
                state.txns.get_mut(preceder).mark = Mark::Blue;
                blue.push(preceder);
                colored.push(preceder);
            } else {
                debug_assert!(mark == Mark::Green || mark == Mark::Blue);
            }
        }

        state.txns.get_mut(txn_id).mark = if poisoned { Mark::Red } else { Mark::Green };

        let subseqers: Vec<TxnId> = state.txns.get(txn_id).subseqers.to_vec();
        for subseqer in subseqers {
            let (spawned, began, mark) = {
                let txn = state.txns.get(subseqer);
                (txn.spawned_flush, txn.began_waiting_for_flush, txn.mark)
            };
            debug_assert!(!spawned);
            if !began {
                debug_assert_eq!(mark, Mark::NotMarked);
            } else if mark == Mark::NotMarked {
                if !poisoned {
                    state.txns.get_mut(subseqer).mark = Mark::Blue;
                    blue.push(subseqer);
                    colored.push(subseqer);
                }
            } else if mark == Mark::Green {
                if poisoned {
                    // A red ancestor re-opens this descendant.
                    state.txns.get_mut(subseqer).mark = Mark::Blue;
                    blue.push(subseqer);
                }
            } else {
                debug_assert!(mark == Mark::Red || mark == Mark::Blue);
            }
        }
    }

    let mut flushable = Vec::with_capacity(colored.len());
    for txn_id in colored {
        let mark = state.txns.get(txn_id).mark;
        state.txns.get_mut(txn_id).mark = Mark::NotMarked;
        match mark {
            Mark::Green => flushable.push(txn_id),
            Mark::Red => {}
            _ => unreachable!("walk left a transaction {:?}", mark),
        }
    }
    trace!(flushable = flushable.len(), "flush.maximal_set");
    flushable
}

/// Combines the flush set's dirtied and touched records per block id,
/// keeping the record with the highest block version. Two writes can never
/// share a version on one block.
pub(crate) fn compute_changes(
    state: &ShardState,
    txns: &[TxnId],
) -> BTreeMap<BlockId, BlockChange> {
    let mut changes: BTreeMap<BlockId, BlockChange> = BTreeMap::new();

    for &txn_id in txns {
        for dirtied in &state.txns.get(txn_id).dirtied {
            let change = BlockChange {
                version: dirtied.block_version,
                modified: true,
                page: dirtied.page,
                recency: dirtied.recency,
            };
            match changes.entry(dirtied.block_id) {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(change);
                }
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    assert_ne!(
                        entry.get().version,
                        change.version,
                        "duplicate write version on block {}",
                        dirtied.block_id
                    );
                    if entry.get().version < change.version {
                        entry.insert(change);
                    }
                }
            }
        }
    }

    for &txn_id in txns {
        for touched in &state.txns.get(txn_id).touched {
            match changes.entry(touched.block_id) {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(BlockChange {
                        version: touched.block_version,
                        modified: false,
                        page: None,
                        recency: touched.recency,
                    });
                }
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    assert_ne!(
                        entry.get().version,
                        touched.block_version,
                        "duplicate write version on block {}",
                        touched.block_id
                    );
                    if entry.get().version < touched.block_version {
                        debug_assert_eq!(
                            touched.recency,
                            superceding_recency(entry.get().recency, touched.recency)
                        );
                        let change = entry.get_mut();
                        change.recency = touched.recency;
                        change.version = touched.block_version;
                    }
                }
            }
        }
    }

    changes
}

/// Partitions compacted changes into the four flush groups, copying the
/// bytes of pages that must be written now.
pub(crate) fn build_flush_job(
    state: &ShardState,
    changes: BTreeMap<BlockId, BlockChange>,
    txns: Vec<TxnId>,
) -> FlushJob {
    let mut deletions = Vec::new();
    let mut tokened = Vec::new();
    let mut writes = Vec::new();
    let mut touched = Vec::new();

    for (block_id, change) in changes {
        if change.modified {
            match change.page {
                None => deletions.push(block_id),
                Some(slot) => {
                    let page = state.pages.get(slot);
                    if let Some(token) = page.token {
                        // Already persisted; only the index entry moves.
                        tokened.push((block_id, token, change.recency));
                    } else {
                        let buf = page
                            .buf
                            .as_ref()
                            .expect("dirty page lost its bytes before flush");
                        writes.push(PendingWrite {
                            block_id,
                            data: buf.data.to_vec(),
                            slot,
                            recency: change.recency,
                        });
                    }
                }
            }
        } else {
            touched.push((block_id, change.recency));
        }
    }

    FlushJob {
        txns,
        deletions,
        tokened,
        writes,
        touched,
    }
}

/// Detaches a flushed (or empty) transaction set from the DAG: both
/// adjacency directions, the last-writer links, and the connection
/// back-pointers, then pulses every flush-complete signal.
pub(crate) fn remove_txn_set_from_graph(state: &mut ShardState, txns: &[TxnId]) {
    for &txn_id in txns {
        let subseqers = std::mem::take(&mut state.txns.get_mut(txn_id).subseqers);
        for subseqer in subseqers {
            state.remove_preceder(subseqer, txn_id);
        }
        // Preceders outside the set exist: read-only transactions complete
        // without waiting for their preceders to leave the graph.
        let preceders = std::mem::take(&mut state.txns.get_mut(txn_id).preceders);
        for preceder in preceders {
            state.remove_subseqer(preceder, txn_id);
        }

        while let Some(&cp_id) = state.txns.get(txn_id).pages_write_acquired_last.last() {
            debug_assert_eq!(state.cps.get(cp_id).last_write_acquirer, Some(txn_id));
            // Everything still queued must be a reader; this was the last
            // write acquirer.
            debug_assert!(state
                .cps
                .get(cp_id)
                .queue
                .iter()
                .all(|&acq| state.acqs.get(acq).access == Access::Read));
            state.last_pages_remove(txn_id, cp_id);
            state.cps.get_mut(cp_id).last_write_acquirer = None;
            let (block_id, realm) = {
                let cp = state.cps.get(cp_id);
                (cp.block_id, cp.realm)
            };
            match realm {
                Realm::Write => state.erase_write_page_for_block_id(block_id),
                _ => state.consider_evicting_current_page(block_id),
            }
        }

        if let Some(conn_id) = state.txns.get_mut(txn_id).conn.take() {
            debug_assert_eq!(state.conns.get(conn_id).newest_txn, Some(txn_id));
            state.conns.get_mut(conn_id).newest_txn = None;
        }

        state.txns.get(txn_id).flush_complete.pulse();
    }
}

/// The serializer-side worker. Jobs arrive in shard order and are applied
/// serially, which is the index-write ordering guarantee.
pub(crate) fn spawn_flush_worker(
    state: Arc<Mutex<ShardState>>,
    serializer: Arc<dyn Serializer>,
    rx: Receiver<FlushJob>,
    write_account: IoAccount,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("cache-flush".into())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                run_flush(&state, serializer.as_ref(), &write_account, job);
            }
        })
        .expect("spawn flush worker")
}

fn run_flush(
    state: &Mutex<ShardState>,
    serializer: &dyn Serializer,
    account: &IoAccount,
    job: FlushJob,
) {
    let batch: Vec<BlockWrite> = job
        .writes
        .iter()
        .map(|write| BlockWrite {
            block_id: write.block_id,
            data: write.data.clone(),
        })
        .collect();

    let tokens = match serializer.block_writes(batch, account) {
        Ok(tokens) => tokens,
        Err(err) => {
            // The transactions stay in the graph and their flush handles
            // stay unpulsed; persistence failures are recovered externally.
            error!(error = %err, "flush.block_writes_failed");
            return;
        }
    };
    assert_eq!(tokens.len(), job.writes.len());

    let mut ops = Vec::with_capacity(
        job.deletions.len() + job.tokened.len() + job.writes.len() + job.touched.len(),
    );
    for &block_id in &job.deletions {
        ops.push(IndexWriteOp {
            block_id,
            token: Some(None),
            recency: Some(Recency::INVALID),
        });
    }
    for &(block_id, token, recency) in &job.tokened {
        ops.push(IndexWriteOp {
            block_id,
            token: Some(Some(token)),
            recency: Some(recency),
        });
    }
    for (index, write) in job.writes.iter().enumerate() {
        ops.push(IndexWriteOp {
            block_id: write.block_id,
            token: Some(Some(tokens[index])),
            recency: Some(write.recency),
        });
    }
    for &(block_id, recency) in &job.touched {
        ops.push(IndexWriteOp {
            block_id,
            token: None,
            recency: Some(recency),
        });
    }

    debug_assert!(!ops.is_empty());
    let result = serializer.index_write(ops, &mut || {
        let mut state = state.lock();
        // Freshly persisted pages learn their tokens and move bags.
        for (index, write) in job.writes.iter().enumerate() {
            let page = state.pages.get_mut(write.slot);
            assert!(page.token.is_none(), "block token installed twice");
            page.token = Some(tokens[index]);
            state.reclassify_page(write.slot);
        }
        // Release the snapshotted dirty pages and the block half of every
        // throttler lease.
        for &txn_id in &job.txns {
            let dirtied = std::mem::take(&mut state.txns.get_mut(txn_id).dirtied);
            for record in dirtied {
                if let Some(slot) = record.page {
                    state.page_unref(slot);
                }
                state.consider_evicting_current_page(record.block_id);
            }
            if let Some(acq) = state.txns.get_mut(txn_id).throttler_acq.as_mut() {
                acq.mark_dirty_pages_written();
            }
        }
        remove_txn_set_from_graph(&mut state, &job.txns);
        for &txn_id in &job.txns {
            state.destroy_txn(txn_id);
        }
        debug!(
            txns = job.txns.len(),
            written = job.writes.len(),
            deleted = job.deletions.len(),
            "flush.index_write_applied"
        );
    });

    if let Err(err) = result {
        error!(error = %err, "flush.index_write_failed");
    }
}
