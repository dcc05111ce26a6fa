//! The page cache shard.
//!
//! One shard owns the three current-page maps (primary, write, RDMA), the
//! page/transaction arenas, the evicter, the admission window, the page
//! pool and the metadata ring. All of it sits behind one mutex; the lock is
//! dropped around serializer I/O, so a load in flight never blocks the
//! shard.

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::ops::Range;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::acquirer::PageAcquirer;
use crate::admission::AdmissionState;
use crate::arena::Arena;
use crate::current::{Access, AcqId, AcquirerState, CpId, CurrentPage, Realm};
use crate::error::{CacheError, Result};
use crate::evict::Evicter;
use crate::flush::{self, FlushJob};
use crate::metadata::{MetadataRing, Peer};
use crate::page::{BagKind, LoadState, Page, PageBuf, PageSlotId};
use crate::pool::PagePool;
use crate::runtime::{CacheOptions, CacheRuntime};
use crate::serializer::{
    BlockToken, IoAccount, Serializer, CACHE_READS_IO_PRIORITY,
};
use crate::signal::Signal;
use crate::throttler::TxnThrottler;
use crate::txn::{
    CacheConnection, ConnId, ConnectionState, FlushHandle, PageTxn, Transaction, TxnId,
};
use crate::types::{
    buffer_is_internal_node, BlockId, BlockType, Recency, MAX_METADATA_BLOCKS,
    RESERVED_BLOCK_COUNT,
};

/// Per-block access statistics, dumped for analysis and used for the
/// internal-node admission shortcut.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct BlockInfo {
    pub is_internal: bool,
    pub hits: u64,
    pub misses: u64,
    pub rdma_hits: u64,
    pub total_accesses: u64,
}

#[derive(Default)]
pub(crate) struct CacheStats {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) rdma_hits: u64,
    pub(crate) writes_hits: u64,
    pub(crate) total_admitted: u64,
    pub(crate) op_count: u64,
    pub(crate) block_info: FxHashMap<BlockId, BlockInfo>,
    pub(crate) internal_nodes: FxHashMap<BlockId, bool>,
    /// Access counts for the current admission window.
    pub(crate) perf: FxHashMap<BlockId, u64>,
    pub(crate) rdma_latency_ns: Vec<u64>,
}

/// Point-in-time counters for callers and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub rdma_hits: u64,
    pub writes_hits: u64,
    pub total_admitted: u64,
    pub in_memory_bytes: u64,
    pub memory_limit: u64,
    pub unevictable_pages: usize,
    pub evictable_disk_backed_pages: usize,
    pub evictable_unbacked_pages: usize,
    pub evicted_pages: usize,
    pub rdma_pages: usize,
}

/// Block-id allocation: released ids are reused before the watermark
/// advances; aux ids live in their own space.
pub(crate) struct FreeList {
    next_id: u64,
    next_aux_index: u64,
    released: Vec<BlockId>,
}

impl FreeList {
    pub(crate) fn new(next_id: u64) -> FreeList {
        FreeList {
            next_id,
            next_aux_index: 0,
            released: Vec::new(),
        }
    }

    pub(crate) fn acquire(&mut self) -> BlockId {
        if let Some(id) = self.released.pop() {
            return id;
        }
        let id = BlockId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn acquire_aux(&mut self) -> BlockId {
        let id = BlockId(crate::types::AUX_BLOCK_ID_THRESHOLD + self.next_aux_index);
        self.next_aux_index += 1;
        id
    }

    pub(crate) fn acquire_chosen(&mut self, id: BlockId) {
        if let Some(position) = self.released.iter().position(|&r| r == id) {
            self.released.swap_remove(position);
        }
        if !id.is_aux() && id.0 >= self.next_id {
            self.next_id = id.0 + 1;
        }
    }

    pub(crate) fn release(&mut self, id: BlockId) {
        if !id.is_aux() {
            self.released.push(id);
        }
    }
}

pub(crate) struct ShardState {
    pub(crate) pages: Arena<PageSlotId, Page>,
    pub(crate) cps: Arena<CpId, CurrentPage>,
    pub(crate) acqs: Arena<AcqId, AcquirerState>,
    pub(crate) txns: Arena<TxnId, Transaction>,
    pub(crate) conns: Arena<ConnId, ConnectionState>,
    pub(crate) current_pages: FxHashMap<BlockId, CpId>,
    pub(crate) write_pages: FxHashMap<BlockId, CpId>,
    pub(crate) rdma_pages: FxHashMap<BlockId, CpId>,
    pub(crate) recencies: Vec<Recency>,
    pub(crate) free_list: FreeList,
    pub(crate) evicter: Evicter,
    pub(crate) stats: CacheStats,
    pub(crate) admission: AdmissionState,
    pub(crate) read_ahead_live: bool,
    pub(crate) max_block_size: u32,
    pub(crate) pool: PagePool,
    pub(crate) ring: MetadataRing,
    pub(crate) peers: Vec<Peer>,
    pub(crate) node_range: Range<u64>,
    pub(crate) options: CacheOptions,
    pub(crate) dump_epoch: u64,
}

impl ShardState {
    pub(crate) fn recency_for_block(&self, id: BlockId) -> Recency {
        if id.is_aux() {
            return Recency::INVALID;
        }
        self.recencies
            .get(id.0 as usize)
            .copied()
            .unwrap_or(Recency::INVALID)
    }

    pub(crate) fn set_recency_for_block(&mut self, id: BlockId, recency: Recency) {
        if id.is_aux() {
            debug_assert_eq!(recency, Recency::INVALID);
            return;
        }
        let index = id.0 as usize;
        if self.recencies.len() <= index {
            self.recencies.resize(index + 1, Recency::INVALID);
        }
        self.recencies[index] = recency;
    }

    /// Materializes the page object for a current-page, without loading.
    /// Deferred pages postpone the serializer read until somebody looks.
    pub(crate) fn ensure_page(&mut self, cp_id: CpId, deferred: bool) -> PageSlotId {
        if let Some(slot) = self.cps.get(cp_id).page {
            return slot;
        }
        debug_assert!(!self.cps.get(cp_id).is_deleted);
        let block_id = self.cps.get(cp_id).block_id;
        let state = if deferred {
            LoadState::DeferredLoading
        } else {
            LoadState::NotLoaded
        };
        let mut page = Page::new(block_id, self.max_block_size, state);
        page.ptr_count = 1;
        let slot = self.pages.insert(page);
        self.cps.get_mut(cp_id).page = Some(slot);
        if deferred {
            self.add_deferred_loaded(slot);
        }
        // Demand pages join the evicter when their load starts.
        slot
    }

    pub(crate) fn page_ref(&mut self, slot: PageSlotId) {
        self.pages.get_mut(slot).ptr_count += 1;
    }

    pub(crate) fn page_unref(&mut self, slot: PageSlotId) {
        let count = {
            let page = self.pages.get_mut(slot);
            debug_assert!(page.ptr_count > 0);
            page.ptr_count -= 1;
            page.ptr_count
        };
        if count == 0 {
            self.destroy_page(slot);
        }
    }

    fn destroy_page(&mut self, slot: PageSlotId) {
        if self.pages.get(slot).bag.is_some() {
            self.remove_page(slot);
        }
        self.release_page_buffer(slot);
        self.pages.remove(slot);
    }

    /// Frees the page's buffer, returning its pool slot and withdrawing the
    /// ring entry if it still points at this copy.
    pub(crate) fn release_page_buffer(&mut self, slot: PageSlotId) {
        let block_id = self.pages.get(slot).block_id;
        if let Some(buf) = self.pages.get_mut(slot).buf.take() {
            if let Some(pool_slot) = buf.slot {
                if self.ring.entry(block_id) == self.pool.offset(pool_slot) as i64 {
                    self.ring.withdraw(block_id);
                }
                self.pool.release(pool_slot);
            }
        }
    }

    /// Installs block bytes into the page, publishing them at a pool offset
    /// when the pool has room. Pool exhaustion degrades to an unpublished
    /// page rather than failing the load.
    pub(crate) fn install_page_buffer(&mut self, slot: PageSlotId, mut data: Vec<u8>) {
        let block_size = self.pages.get(slot).block_size as usize;
        data.resize(block_size, 0);
        let block_id = self.pages.get(slot).block_id;
        let pool_slot = match self.pool.alloc() {
            Ok(pool_slot) => {
                let _ = self.pool.publish(pool_slot, &data);
                self.ring.publish(block_id, self.pool.offset(pool_slot));
                Some(pool_slot)
            }
            Err(_) => {
                warn!(block = %block_id, "cache.pool_exhausted");
                None
            }
        };
        self.pages.get_mut(slot).buf = Some(PageBuf {
            slot: pool_slot,
            data: data.into_boxed_slice(),
        });
    }

    /// Wipes the current-page for a block if nothing is interested in it
    /// anymore. A live read-ahead callback makes this a no-op: read-ahead
    /// uses the existence of current-page entries to reject stale buffers.
    pub(crate) fn consider_evicting_current_page(&mut self, block_id: BlockId) {
        if self.read_ahead_live {
            return;
        }
        if let Some(&cp_id) = self.current_pages.get(&block_id) {
            if self.should_be_evicted(cp_id) {
                self.ring.withdraw(block_id);
                self.current_pages.remove(&block_id);
                self.reset_current_page(cp_id);
            }
        }
    }

    pub(crate) fn erase_write_page_for_block_id(&mut self, block_id: BlockId) {
        if let Some(&cp_id) = self.write_pages.get(&block_id) {
            if self.should_be_evicted(cp_id) {
                self.write_pages.remove(&block_id);
                self.reset_current_page(cp_id);
            }
        }
    }

    /// One-shot remote pages die with their last acquirer.
    pub(crate) fn maybe_destroy_detached(&mut self, cp_id: CpId) {
        let cp = self.cps.get(cp_id);
        if cp.queue.is_empty() && cp.last_write_acquirer.is_none() && cp.keepalives == 0 {
            self.reset_current_page(cp_id);
        }
    }

    fn reset_current_page(&mut self, cp_id: CpId) {
        let (block_id, is_deleted) = {
            let cp = self.cps.get(cp_id);
            assert!(cp.queue.is_empty());
            assert_eq!(cp.keepalives, 0);
            assert!(cp.last_write_acquirer.is_none());
            (cp.block_id, cp.is_deleted)
        };
        if let Some(slot) = self.cps.get_mut(cp_id).page.take() {
            self.page_unref(slot);
        }
        self.cps.remove(cp_id);
        if is_deleted && !block_id.is_null() {
            self.free_list.release(block_id);
        }
    }

    pub(crate) fn release_acquirer(&mut self, acq_id: AcqId) {
        let (txn, cp_id, block_id, realm) = {
            let acq = self.acqs.get(acq_id);
            let realm = self.cps.get(acq.cp).realm;
            (acq.txn, acq.cp, acq.block_id, realm)
        };
        if let Some(txn_id) = txn {
            self.txn_remove_acquirer(txn_id, acq_id);
        }
        let in_queue = self.cps.get(cp_id).queue.contains(&acq_id);
        if in_queue {
            debug_assert!(self.acqs.get(acq_id).snapshot.is_none());
            self.cp_remove_acquirer(cp_id, acq_id);
        }
        if self.acqs.get(acq_id).declared_snapshotted {
            if let Some(snapshot) = self.acqs.get_mut(acq_id).snapshot.take() {
                if let Some(page) = snapshot.page {
                    self.page_unref(page);
                }
            }
            let cp = self.cps.get_mut(cp_id);
            debug_assert!(cp.keepalives > 0);
            cp.keepalives -= 1;
        }
        self.acqs.remove(acq_id);
        match realm {
            Realm::Detached => self.maybe_destroy_detached(cp_id),
            Realm::Write => self.erase_write_page_for_block_id(block_id),
            _ => self.consider_evicting_current_page(block_id),
        }
    }

    pub(crate) fn add_read_ahead_buf(&mut self, block_id: BlockId, data: Vec<u8>, token: BlockToken) {
        // Once the callback is torn down, current-pages may be getting
        // destroyed; a late buffer could be stale.
        if !self.read_ahead_live {
            return;
        }
        // An existing entry means the block may have moved past this copy.
        if self.current_pages.contains_key(&block_id) {
            return;
        }
        let mut page = Page::new(block_id, self.max_block_size, LoadState::Loaded);
        page.ptr_count = 1;
        page.token = Some(token);
        let slot = self.pages.insert(page);
        self.install_page_buffer(slot, data);
        let cp_id = self
            .cps
            .insert(CurrentPage::new(block_id, Realm::Primary, Some(slot)));
        self.current_pages.insert(block_id, cp_id);
        self.bump_access(slot);
        self.add_to_evictable_disk_backed(slot);
        debug!(block = %block_id, "cache.read_ahead.accepted");
    }

    fn bump_perf(&mut self, id: BlockId) {
        *self.stats.perf.entry(id).or_insert(0) += 1;
    }

    pub(crate) fn update_block_info(
        &mut self,
        id: BlockId,
        is_internal: bool,
        hit: bool,
        miss: bool,
        rdma_hit: bool,
    ) {
        let info = self.stats.block_info.entry(id).or_default();
        if hit {
            info.hits += 1;
        }
        if miss {
            info.misses += 1;
        }
        if rdma_hit {
            info.rdma_hits += 1;
        }
        if is_internal {
            info.is_internal = true;
        }
        if hit || miss || rdma_hit {
            info.total_accesses += 1;
        }
    }

    pub(crate) fn update_internal_map(&mut self, id: BlockId, is_internal: bool) {
        self.stats.internal_nodes.insert(id, is_internal);
    }

    fn note_leaf_if_internal(&mut self, cp_id: CpId) {
        let slot = match self.cps.get(cp_id).page {
            Some(slot) => slot,
            None => return,
        };
        let internal = {
            let page = self.pages.get(slot);
            page.is_loaded()
                && page
                    .buf
                    .as_ref()
                    .map_or(false, |buf| buffer_is_internal_node(&buf.data))
        };
        if internal {
            let block_id = self.cps.get(cp_id).block_id;
            self.update_internal_map(block_id, true);
            self.update_block_info(block_id, true, false, false, false);
        }
    }

    /// The admission policy's verdict for a remotely held block: on the
    /// CDF admit list, or read hard enough within this window.
    fn admission_can_admit(&self, block_id: BlockId) -> bool {
        if self.admission.can_admit(block_id) {
            return true;
        }
        let window_reads = self.stats.perf.get(&block_id).copied().unwrap_or(0);
        AdmissionState::hot_enough(window_reads)
    }
}

pub struct PageCache {
    state: Arc<Mutex<ShardState>>,
    serializer: Arc<dyn Serializer>,
    runtime: Arc<CacheRuntime>,
    reads_account: IoAccount,
    max_block_size: u32,
    flush_tx: Mutex<Option<Sender<FlushJob>>>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
}

impl PageCache {
    pub fn new(serializer: Arc<dyn Serializer>, runtime: Arc<CacheRuntime>) -> Result<Arc<PageCache>> {
        let max_block_size = serializer.max_block_size();
        if max_block_size == 0 {
            return Err(CacheError::InvalidArgument("max block size is zero"));
        }
        let memory_limit = runtime.balancer.base_mem_per_store();
        let local = runtime.config.local_host()?;
        let node_range = runtime.config.node_block_range()?;

        let pool_slots = runtime.options.pool_slots.unwrap_or_else(|| {
            let budget_slots = (memory_limit / max_block_size as u64).saturating_mul(2);
            budget_slots.clamp(64, 1 << 20) as u32
        });
        let pool = PagePool::new(max_block_size as usize, pool_slots);
        let ring = MetadataRing::new(MAX_METADATA_BLOCKS);
        runtime
            .transport
            .register_memory(&local.host, local.memory_port, pool.region())?;
        runtime
            .transport
            .register_memory(&local.host, local.metadata_port, ring.region())?;

        let recencies = serializer.get_all_recencies();
        // Reserved low ids are only ever chosen explicitly.
        let next_block_id = (recencies.len() as u64).max(RESERVED_BLOCK_COUNT);
        let read_ahead = runtime.balancer.read_ahead_ok_at_start();

        let state = Arc::new(Mutex::new(ShardState {
            pages: Arena::new(),
            cps: Arena::new(),
            acqs: Arena::new(),
            txns: Arena::new(),
            conns: Arena::new(),
            current_pages: FxHashMap::default(),
            write_pages: FxHashMap::default(),
            rdma_pages: FxHashMap::default(),
            recencies,
            free_list: FreeList::new(next_block_id),
            evicter: Evicter::new(memory_limit, Arc::clone(&runtime.balancer)),
            stats: CacheStats::default(),
            admission: AdmissionState::default(),
            read_ahead_live: read_ahead,
            max_block_size,
            pool,
            ring,
            peers: Vec::new(),
            node_range,
            options: runtime.options.clone(),
            dump_epoch: 0,
        }));

        if read_ahead {
            let cb_state = Arc::clone(&state);
            serializer.register_read_ahead_cb(Box::new(move |block_id, data, token| {
                cb_state.lock().add_read_ahead_buf(block_id, data, token);
            }));
        }

        runtime
            .throttler
            .inform_memory_limit_change(memory_limit, max_block_size);

        let reads_account = serializer.make_io_account(CACHE_READS_IO_PRIORITY, 16);
        let write_account = serializer.make_io_account(CACHE_READS_IO_PRIORITY, 16);
        let (flush_tx, flush_rx) = mpsc::channel();
        let worker = flush::spawn_flush_worker(
            Arc::clone(&state),
            Arc::clone(&serializer),
            flush_rx,
            write_account,
        );

        info!(
            host = %local.host,
            memory_limit,
            max_block_size,
            pool_slots,
            "cache.created"
        );

        Ok(Arc::new(PageCache {
            state,
            serializer,
            runtime,
            reads_account,
            max_block_size,
            flush_tx: Mutex::new(Some(flush_tx)),
            flush_worker: Mutex::new(Some(worker)),
        }))
    }

    /// Connects to every configured peer: one queue pair into its metadata
    /// ring (polled in the background) and one into its page pool.
    /// Unreachable peers are skipped; they simply never serve the RDMA
    /// tier.
    pub fn connect_peers(&self) -> Result<()> {
        let hosts = self.runtime.config.peer_hosts()?;
        let interval = self.runtime.options.ring_poll_interval;
        let mut connected = Vec::new();
        for host in hosts {
            let ring_qp = match self.runtime.transport.connect(&host.host, host.metadata_port) {
                Ok(qp) => qp,
                Err(err) => {
                    warn!(host = %host.host, error = %err, "cache.peer_connect_failed");
                    continue;
                }
            };
            let pool_qp = match self.runtime.transport.connect(&host.host, host.memory_port) {
                Ok(qp) => qp,
                Err(err) => {
                    warn!(host = %host.host, error = %err, "cache.peer_connect_failed");
                    continue;
                }
            };
            connected.push(Peer::new(
                host.host.clone(),
                ring_qp,
                pool_qp,
                MAX_METADATA_BLOCKS,
                interval,
            )?);
            info!(host = %host.host, "cache.peer_connected");
        }
        self.state.lock().peers.extend(connected);
        Ok(())
    }

    pub fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    pub fn create_cache_account(&self, priority: i32) -> IoAccount {
        // Priority 100 means parity with the unaccounted traffic.
        let io_priority = (CACHE_READS_IO_PRIORITY * priority / 100).max(1);
        let outstanding = (16 * priority / 100).max(1);
        self.serializer.make_io_account(io_priority, outstanding)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let state = self.state.lock();
        CacheStatsSnapshot {
            hits: state.stats.hits,
            misses: state.stats.misses,
            rdma_hits: state.stats.rdma_hits,
            writes_hits: state.stats.writes_hits,
            total_admitted: state.stats.total_admitted,
            in_memory_bytes: state.evicter.in_memory_size(),
            memory_limit: state.evicter.memory_limit,
            unevictable_pages: state.evicter.bag(BagKind::Unevictable).len(),
            evictable_disk_backed_pages: state.evicter.bag(BagKind::EvictableDiskBacked).len(),
            evictable_unbacked_pages: state.evicter.bag(BagKind::EvictableUnbacked).len(),
            evicted_pages: state.evicter.bag(BagKind::Evicted).len(),
            rdma_pages: state.evicter.bag(BagKind::Rdma).len(),
        }
    }

    pub fn total_page_memory(&self) -> u64 {
        let state = self.state.lock();
        BagKind::ALL
            .iter()
            .map(|&kind| state.evicter.bag(kind).bytes)
            .sum()
    }

    pub fn evictable_page_memory(&self) -> u64 {
        let state = self.state.lock();
        state.evicter.bag(BagKind::EvictableDiskBacked).bytes
            + state.evicter.bag(BagKind::EvictableUnbacked).bytes
    }

    pub fn memory_limit(&self) -> u64 {
        self.state.lock().evicter.memory_limit
    }

    pub fn block_in_primary_map(&self, id: BlockId) -> bool {
        self.state.lock().current_pages.contains_key(&id)
    }

    pub fn block_in_write_map(&self, id: BlockId) -> bool {
        self.state.lock().write_pages.contains_key(&id)
    }

    pub fn block_in_rdma_map(&self, id: BlockId) -> bool {
        self.state.lock().rdma_pages.contains_key(&id)
    }

    pub fn recency_of(&self, id: BlockId) -> Recency {
        self.state.lock().recency_for_block(id)
    }

    /// Where the metadata mirrors currently say a block can be fetched
    /// from, if any peer advertises it.
    pub fn remote_offset_of(&self, id: BlockId) -> Option<(String, u64)> {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .find_map(|peer| peer.mirror.lookup(id).map(|offset| (peer.host.clone(), offset)))
    }

    /// Forces an admission recompute from the current window, as the
    /// periodic maintenance would. The window is cleared.
    pub fn recompute_admission(&self) {
        let mut state = self.state.lock();
        self.run_admission_recompute(&mut state);
    }

    /// Rebalances to a new memory budget. Shrinking drains the disk-backed
    /// evictable bag oldest-first until the limit holds.
    pub fn update_memory_limit(
        &self,
        new_limit: u64,
        bytes_loaded_accounted_for: i64,
        access_count_accounted_for: u64,
        read_ahead_ok: bool,
    ) {
        {
            let mut state = self.state.lock();
            if !read_ahead_ok {
                self.have_read_ahead_cb_destroyed(&mut state);
            }
            state.evicter.bytes_loaded_counter -= bytes_loaded_accounted_for;
            state.evicter.access_count_counter = state
                .evicter
                .access_count_counter
                .saturating_sub(access_count_accounted_for);
            state.evicter.memory_limit = new_limit;
            info!(new_limit, "cache.memory_limit_updated");
            state.evict_if_necessary();
        }
        self.runtime
            .throttler
            .inform_memory_limit_change(new_limit, self.max_block_size);
    }

    pub fn bytes_loaded(&self) -> i64 {
        self.state.lock().evicter.bytes_loaded_counter
    }

    pub fn access_count(&self) -> u64 {
        self.state.lock().evicter.access_count_counter
    }

    pub fn throttler(&self) -> &Arc<TxnThrottler> {
        &self.runtime.throttler
    }

    fn have_read_ahead_cb_destroyed(&self, state: &mut ShardState) {
        if !state.read_ahead_live {
            return;
        }
        state.read_ahead_live = false;
        self.serializer.unregister_read_ahead_cb();
        // Entries that only existed to satisfy the intake guard can go now.
        let ids: Vec<BlockId> = state.current_pages.keys().copied().collect();
        for id in ids {
            state.consider_evicting_current_page(id);
        }
        debug!("cache.read_ahead.destroyed");
    }

    // ------------------------------------------------------------------
    // Transactions and connections
    // ------------------------------------------------------------------

    pub(crate) fn register_connection(&self) -> ConnId {
        self.state
            .lock()
            .conns
            .insert(ConnectionState { newest_txn: None })
    }

    pub(crate) fn unregister_connection(&self, conn_id: ConnId) {
        let mut state = self.state.lock();
        if let Some(txn_id) = state.conns.get_mut(conn_id).newest_txn.take() {
            // Soft durability can leave the newest transaction alive past
            // its connection; it just loses the back-pointer.
            state.txns.get_mut(txn_id).conn = None;
        }
        state.conns.remove(conn_id);
    }

    /// Begins a write transaction, waiting on the throttler for dirty-page
    /// headroom. With a connection, the connection's previous newest
    /// transaction becomes a preceder.
    pub fn begin_txn(self: &Arc<Self>, conn: Option<&CacheConnection>) -> PageTxn {
        let throttler_acq = self.runtime.throttler.begin_txn_acq();
        let mut state = self.state.lock();
        let txn_id = state.txns.insert(Transaction::new(Some(throttler_acq)));
        if let Some(conn) = conn {
            let previous = state.conns.get_mut(conn.id).newest_txn.replace(txn_id);
            state.txns.get_mut(txn_id).conn = Some(conn.id);
            if let Some(old_txn) = previous {
                debug_assert_eq!(state.txns.get(old_txn).conn, Some(conn.id));
                state.txns.get_mut(old_txn).conn = None;
                state.connect_preceder(txn_id, old_txn);
            }
        }
        PageTxn {
            cache: Arc::clone(self),
            id: txn_id,
            finished: false,
        }
    }

    /// A transaction for pure readers: no throttler lease, no DAG
    /// membership, ended with [`PageCache::end_read_txn`].
    pub fn begin_read_txn(self: &Arc<Self>) -> PageTxn {
        let mut state = self.state.lock();
        let txn_id = state.txns.insert(Transaction::new(None));
        PageTxn {
            cache: Arc::clone(self),
            id: txn_id,
            finished: false,
        }
    }

    /// Announces the transaction for flushing and hands it to the flush
    /// scheduler. The returned handle pulses once its whole flush set has
    /// been applied in one index write.
    pub fn flush_and_destroy_txn(&self, mut txn: PageTxn) -> FlushHandle {
        let mut state = self.state.lock();
        let signal = {
            let t = state.txns.get_mut(txn.id);
            assert_eq!(t.live_acqs, 0, "an acquirer outlives its transaction");
            assert!(!t.began_waiting_for_flush);
            t.began_waiting_for_flush = true;
            t.flush_complete.clone()
        };
        self.im_waiting_for_flush(&mut state, txn.id);
        txn.finished = true;
        FlushHandle { signal }
    }

    /// Cheap completion for transactions that only read: pulses
    /// immediately and leaves the DAG untouched.
    pub fn end_read_txn(&self, mut txn: PageTxn) {
        let mut state = self.state.lock();
        {
            let t = state.txns.get(txn.id);
            assert!(t.touched.is_empty(), "read transaction touched a page");
            assert!(t.dirtied.is_empty(), "read transaction dirtied a page");
            assert_eq!(t.live_acqs, 0, "an acquirer outlives its transaction");
            assert!(!t.began_waiting_for_flush);
            assert!(t.conn.is_none());
        }
        state.txns.get(txn.id).flush_complete.pulse();
        state.destroy_txn(txn.id);
        txn.finished = true;
    }

    /// A transaction handle was dropped without an explicit flush. One that
    /// changed anything is a bug; a clean one announces an empty flush so
    /// its DAG links unwind through the normal path.
    pub(crate) fn abandon_txn(&self, txn_id: TxnId) {
        let mut state = self.state.lock();
        {
            let t = state.txns.get_mut(txn_id);
            assert!(
                t.dirtied.is_empty() && t.touched.is_empty() && t.live_acqs == 0,
                "transaction dropped without flush_and_destroy_txn"
            );
            assert!(!t.began_waiting_for_flush);
            t.began_waiting_for_flush = true;
        }
        self.im_waiting_for_flush(&mut state, txn_id);
    }

    pub(crate) fn im_waiting_for_flush(&self, state: &mut ShardState, base: TxnId) {
        debug_assert!(state.txns.get(base).began_waiting_for_flush);
        debug_assert!(!state.txns.get(base).spawned_flush);

        let flush_set = flush::maximal_flushable_txn_set(state, base);
        if flush_set.is_empty() {
            return;
        }
        for &txn_id in &flush_set {
            debug_assert!(!state.txns.get(txn_id).spawned_flush);
            state.txns.get_mut(txn_id).spawned_flush = true;
        }
        let changes = flush::compute_changes(state, &flush_set);
        if changes.is_empty() {
            // Nothing to persist; complete in place.
            flush::remove_txn_set_from_graph(state, &flush_set);
            for txn_id in flush_set {
                state.destroy_txn(txn_id);
            }
        } else {
            let job = flush::build_flush_job(state, changes, flush_set);
            let tx = self.flush_tx.lock();
            tx.as_ref()
                .expect("flush worker stopped")
                .send(job)
                .expect("flush worker stopped");
        }
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    pub(crate) fn write_acquire(
        self: &Arc<Self>,
        txn_id: TxnId,
        block_id: BlockId,
    ) -> Result<PageAcquirer> {
        let mut state = self.state.lock();
        let cp_id = self.lookup_page(&mut state, block_id, false);
        let acq_id = state
            .acqs
            .insert(AcquirerState::new(block_id, cp_id, Some(txn_id), Access::Write));
        state.txn_add_acquirer(txn_id, acq_id);
        state.cp_add_acquirer(cp_id, acq_id);
        Ok(self.acquirer_handle(&state, acq_id, block_id, Access::Write))
    }

    /// A standalone read acquirer; reads never join a transaction's
    /// acquirer set.
    pub fn read_acquire(self: &Arc<Self>, block_id: BlockId) -> Result<PageAcquirer> {
        let mut state = self.state.lock();
        let cp_id = self.lookup_page(&mut state, block_id, true);
        let acq_id = state
            .acqs
            .insert(AcquirerState::new(block_id, cp_id, None, Access::Read));
        state.cp_add_acquirer(cp_id, acq_id);
        Ok(self.acquirer_handle(&state, acq_id, block_id, Access::Read))
    }

    pub(crate) fn create_block(
        self: &Arc<Self>,
        txn_id: TxnId,
        block_type: BlockType,
    ) -> Result<PageAcquirer> {
        let mut state = self.state.lock();
        let block_id = match block_type {
            BlockType::Normal => state.free_list.acquire(),
            BlockType::Aux => state.free_list.acquire_aux(),
        };
        self.create_acquire(&mut state, txn_id, block_id)
    }

    pub(crate) fn create_chosen_block(
        self: &Arc<Self>,
        txn_id: TxnId,
        block_id: BlockId,
    ) -> Result<PageAcquirer> {
        let mut state = self.state.lock();
        state.free_list.acquire_chosen(block_id);
        self.create_acquire(&mut state, txn_id, block_id)
    }

    fn create_acquire(
        self: &Arc<Self>,
        state: &mut ShardState,
        txn_id: TxnId,
        block_id: BlockId,
    ) -> Result<PageAcquirer> {
        let cp_id = self.new_chosen_page(state, block_id)?;
        let acq_id = state
            .acqs
            .insert(AcquirerState::new(block_id, cp_id, Some(txn_id), Access::Write));
        state.txn_add_acquirer(txn_id, acq_id);
        state.cp_add_acquirer(cp_id, acq_id);
        Ok(self.acquirer_handle(state, acq_id, block_id, Access::Write))
    }

    fn acquirer_handle(
        self: &Arc<Self>,
        state: &ShardState,
        acq_id: AcqId,
        block_id: BlockId,
        access: Access,
    ) -> PageAcquirer {
        let acq = state.acqs.get(acq_id);
        PageAcquirer::new(
            Arc::clone(self),
            acq_id,
            block_id,
            access,
            Arc::clone(&acq.read_signal),
            Arc::clone(&acq.write_signal),
        )
    }

    /// Builds the current-page for a freshly created block: a loaded,
    /// zeroed, unbacked page. Created blocks (other than the serializer's
    /// reserved low ids) live in the write shard.
    fn new_chosen_page(&self, state: &mut ShardState, block_id: BlockId) -> Result<CpId> {
        debug_assert!(
            block_id.is_aux() || !state.recency_for_block(block_id).is_valid(),
            "chosen block id {block_id} is still live"
        );
        if !block_id.is_aux() {
            state.set_recency_for_block(block_id, Recency::DISTANT_PAST);
        }
        let mut page = Page::new(block_id, self.max_block_size, LoadState::Loaded);
        page.is_write = true;
        page.ptr_count = 1;
        let slot = state.pages.insert(page);
        state.install_page_buffer(slot, vec![0u8; self.max_block_size as usize]);

        let to_write_shard = state.options.write_shard_enabled && !block_id.is_reserved();
        let realm = if to_write_shard {
            Realm::Write
        } else {
            Realm::Primary
        };
        let cp_id = state
            .cps
            .insert(CurrentPage::new(block_id, realm, Some(slot)));
        let previous = if to_write_shard {
            state.write_pages.insert(block_id, cp_id)
        } else {
            state.current_pages.insert(block_id, cp_id)
        };
        assert!(previous.is_none(), "block id created twice");

        state.bump_access(slot);
        state.add_to_evictable_unbacked(slot);
        state.stats.misses += 1;
        Ok(cp_id)
    }

    /// The tiered lookup: write map, primary map, the local RDMA map, then
    /// remote peers (reads only), then a not-yet-loaded entry backed by the
    /// serializer.
    fn lookup_page(&self, state: &mut ShardState, block_id: BlockId, is_read: bool) -> CpId {
        state.stats.op_count += 1;
        let cp_id = self.lookup_page_inner(state, block_id, is_read);
        self.maybe_periodic_maintenance(state);
        cp_id
    }

    fn lookup_page_inner(&self, state: &mut ShardState, block_id: BlockId, is_read: bool) -> CpId {
        if let Some(&cp_id) = state.write_pages.get(&block_id) {
            state.stats.writes_hits += 1;
            state.stats.hits += 1;
            state.bump_perf(block_id);
            state.note_leaf_if_internal(cp_id);
            state.update_block_info(block_id, false, true, false, false);
            assert!(!state.cps.get(cp_id).is_deleted);
            return cp_id;
        }
        if let Some(&cp_id) = state.current_pages.get(&block_id) {
            state.stats.hits += 1;
            state.bump_perf(block_id);
            state.note_leaf_if_internal(cp_id);
            state.update_block_info(block_id, false, true, false, false);
            assert!(!state.cps.get(cp_id).is_deleted);
            return cp_id;
        }

        state.bump_perf(block_id);
        if is_read && state.options.rdma_enabled {
            if let Some(&cp_id) = state.rdma_pages.get(&block_id) {
                state.stats.hits += 1;
                state.update_block_info(block_id, false, true, false, false);
                return cp_id;
            }
            if let Some(cp_id) = self.try_remote_fetch(state, block_id) {
                return cp_id;
            }
        }

        // Not cached anywhere we can see; a serializer read will fill it
        // in on first materialization.
        let cp_id = state
            .cps
            .insert(CurrentPage::new(block_id, Realm::Primary, None));
        state.current_pages.insert(block_id, cp_id);
        state.stats.misses += 1;
        state.update_block_info(block_id, false, false, true, false);
        cp_id
    }

    /// One-sided fetch from the first peer whose ring lists the block.
    /// Transport faults degrade to a miss; the caller falls through to
    /// disk.
    fn try_remote_fetch(&self, state: &mut ShardState, block_id: BlockId) -> Option<CpId> {
        let (peer_index, offset) = state
            .peers
            .iter()
            .enumerate()
            .find_map(|(index, peer)| peer.mirror.lookup(block_id).map(|offset| (index, offset)))?;

        let mut data = vec![0u8; self.max_block_size as usize];
        let started = Instant::now();
        let outcome = state.peers[peer_index].pool.read(&mut data, offset);
        let host = state.peers[peer_index].host.clone();
        match outcome {
            Ok(()) => {
                state
                    .stats
                    .rdma_latency_ns
                    .push(started.elapsed().as_nanos() as u64);
                state.stats.rdma_hits += 1;
                let internal = buffer_is_internal_node(&data);
                let admitted = state.node_range.contains(&block_id.0)
                    || internal
                    || state.admission_can_admit(block_id);

                let mut page = Page::new(block_id, self.max_block_size, LoadState::Loaded);
                page.is_rdma = true;
                page.ptr_count = 1;
                let slot = state.pages.insert(page);
                if admitted {
                    state.install_page_buffer(slot, data);
                } else {
                    let mut one_shot = data;
                    one_shot.resize(self.max_block_size as usize, 0);
                    state.pages.get_mut(slot).buf = Some(PageBuf {
                        slot: None,
                        data: one_shot.into_boxed_slice(),
                    });
                }
                let realm = if admitted { Realm::Rdma } else { Realm::Detached };
                let cp_id = state
                    .cps
                    .insert(CurrentPage::new(block_id, realm, Some(slot)));
                state.bump_access(slot);
                state.add_to_evictable_rdma(slot);
                if admitted {
                    state.rdma_pages.insert(block_id, cp_id);
                    state.stats.total_admitted += 1;
                    if internal {
                        state.update_internal_map(block_id, true);
                    }
                }
                state.update_block_info(block_id, internal, false, false, true);
                debug!(block = %block_id, peer = %host, admitted, "cache.rdma.hit");
                Some(cp_id)
            }
            Err(err) => {
                warn!(block = %block_id, peer = %host, error = %err, "cache.rdma.read_failed");
                None
            }
        }
    }

    fn maybe_periodic_maintenance(&self, state: &mut ShardState) {
        let interval = state.options.admission_refresh_ops;
        if interval == 0 || state.stats.op_count % interval != 0 {
            return;
        }
        self.run_admission_recompute(state);
        state.log_bag_occupancy();
        info!(
            hits = state.stats.hits,
            misses = state.stats.misses,
            rdma_hits = state.stats.rdma_hits,
            rdma_latency_ns = state.admission.latency.rdma_ns,
            admitted = state.stats.total_admitted,
            "cache.window_rollover"
        );
        if let Some(dir) = state.options.dump_dir.clone() {
            if let Err(err) = crate::dump::write_epoch(state, &dir) {
                warn!(error = %err, "cache.dump_failed");
            }
            state.dump_epoch += 1;
        }
    }

    fn run_admission_recompute(&self, state: &mut ShardState) {
        if !state.stats.rdma_latency_ns.is_empty() {
            let sum: u64 = state.stats.rdma_latency_ns.iter().sum();
            state.admission.latency.rdma_ns = sum / state.stats.rdma_latency_ns.len() as u64;
            state.stats.rdma_latency_ns.clear();
        }
        let cache_size_blocks =
            (state.evicter.memory_limit / self.max_block_size as u64).max(1);
        let window = std::mem::take(&mut state.stats.perf);
        state.admission.recompute(&window, cache_size_blocks);
    }

    // ------------------------------------------------------------------
    // Page materialization
    // ------------------------------------------------------------------

    /// Resolves an acquirer to a loaded page, performing the serializer
    /// read outside the shard lock if the page is not resident. Returns the
    /// lock guard so the caller can use the bytes race-free.
    pub(crate) fn loaded_slot_for_acq(
        &self,
        acq_id: AcqId,
    ) -> Result<(MutexGuard<'_, ShardState>, PageSlotId)> {
        loop {
            let mut state = self.state.lock();
            let (snapshot_page, cp_id, block_id) = {
                let acq = state.acqs.get(acq_id);
                (
                    acq.snapshot.as_ref().map(|s| s.page),
                    acq.cp,
                    acq.block_id,
                )
            };
            let slot = match snapshot_page {
                Some(Some(slot)) => slot,
                // A snapshot of a deleted block has nothing to read.
                Some(None) => return Err(CacheError::BlockNotFound(block_id.0)),
                None => {
                    assert!(
                        !state.cps.get(cp_id).is_deleted,
                        "page access on a deleted block"
                    );
                    state.ensure_page(cp_id, false)
                }
            };

            match state.pages.get(slot).state {
                LoadState::Loaded => {
                    state.bump_access(slot);
                    return Ok((state, slot));
                }
                LoadState::Loading => {
                    let signal = state
                        .pages
                        .get(slot)
                        .load_signal
                        .clone()
                        .expect("loading page carries a signal");
                    state.pages.get_mut(slot).load_waiters += 1;
                    state.reclassify_page(slot);
                    drop(state);
                    signal.wait();
                    let mut state = self.state.lock();
                    state.pages.get_mut(slot).load_waiters -= 1;
                    let settled = {
                        let page = state.pages.get(slot);
                        page.bag == Some(BagKind::Unevictable)
                            && page.is_loaded()
                            && !page.has_waiters()
                    };
                    if settled {
                        state.move_unevictable_to_evictable(slot);
                    } else {
                        state.reclassify_page(slot);
                    }
                }
                LoadState::NotLoaded | LoadState::DeferredLoading | LoadState::Evicted => {
                    let token = state.pages.get(slot).token;
                    let usage = state.pages.get(slot).hypothetical_memory_usage();
                    let fresh = state.pages.get(slot).bag.is_none();
                    state.pages.get_mut(slot).state = LoadState::Loading;
                    let signal = Arc::new(Signal::new());
                    state.pages.get_mut(slot).load_signal = Some(Arc::clone(&signal));
                    if fresh {
                        state.add_not_yet_loaded(slot);
                    } else {
                        state.reloading_page(slot);
                    }
                    drop(state);

                    let loaded = match token {
                        Some(token) => self
                            .serializer
                            .read_token(token)
                            .map(|data| (data, token)),
                        None => self
                            .serializer
                            .read_block(block_id, &self.reads_account)
                            .map(|block| (block.data, block.token)),
                    };

                    let mut state = self.state.lock();
                    match loaded {
                        Ok((data, token)) => {
                            state.install_page_buffer(slot, data);
                            {
                                let page = state.pages.get_mut(slot);
                                page.state = LoadState::Loaded;
                                page.token = Some(token);
                                if let Some(signal) = page.load_signal.take() {
                                    signal.pulse();
                                }
                            }
                            state.bump_access(slot);
                            state.reclassify_page(slot);
                        }
                        Err(err) => {
                            {
                                let page = state.pages.get_mut(slot);
                                page.state = if token.is_some() {
                                    LoadState::Evicted
                                } else {
                                    LoadState::NotLoaded
                                };
                                if let Some(signal) = page.load_signal.take() {
                                    signal.pulse();
                                }
                            }
                            state.reclassify_page(slot);
                            state.notify_bytes_loading(-(usage as i64));
                            error!(block = %block_id, error = %err, "cache.load_failed");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Runs `f` on the loaded bytes of an acquirer's page.
    pub(crate) fn with_page_bytes<R>(
        &self,
        acq_id: AcqId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let (state, slot) = self.loaded_slot_for_acq(acq_id)?;
        let page = state.pages.get(slot);
        let buf = page.buf.as_ref().expect("loaded page has a buffer");
        Ok(f(&buf.data))
    }

    /// Runs `f` on the writable bytes of an acquirer's page. The page is
    /// forked first if snapshots or pending flushes still reference the old
    /// value, the block token is dropped (the bytes no longer match any
    /// persisted copy), and the new value is republished to the pool.
    pub(crate) fn with_page_bytes_mut<R>(
        &self,
        acq_id: AcqId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let (mut state, mut slot) = self.loaded_slot_for_acq(acq_id)?;
        if state.pages.get(slot).ptr_count > 1 {
            slot = self.fork_page_for_write(&mut state, acq_id, slot);
        }
        state.acqs.get_mut(acq_id).dirtied = true;
        let result = {
            let page = state.pages.get_mut(slot);
            let buf = page.buf.as_mut().expect("loaded page has a buffer");
            f(&mut buf.data)
        };
        let had_token = state.pages.get_mut(slot).token.take().is_some();
        {
            let page = state.pages.get(slot);
            let buf = page.buf.as_ref().expect("loaded page has a buffer");
            if let Some(pool_slot) = buf.slot {
                let _ = state.pool.publish(pool_slot, &buf.data);
            }
        }
        if had_token {
            state.reclassify_page(slot);
        }
        Ok(result)
    }

    /// Copy-on-write: snapshotted readers and unflushed dirty records keep
    /// the old page; the current-page gets a fresh copy for the new value.
    fn fork_page_for_write(
        &self,
        state: &mut ShardState,
        acq_id: AcqId,
        old_slot: PageSlotId,
    ) -> PageSlotId {
        let cp_id = state.acqs.get(acq_id).cp;
        debug_assert_eq!(state.cps.get(cp_id).page, Some(old_slot));
        let (block_id, data, token, is_write) = {
            let page = state.pages.get(old_slot);
            (
                page.block_id,
                page.buf.as_ref().expect("forking a loaded page").data.to_vec(),
                page.token,
                page.is_write,
            )
        };
        let mut fresh = Page::new(block_id, self.max_block_size, LoadState::Loaded);
        fresh.ptr_count = 1;
        fresh.token = token;
        fresh.is_write = is_write;
        let new_slot = state.pages.insert(fresh);
        state.install_page_buffer(new_slot, data);

        // The current-page's reference moves to the copy; the old page
        // lives on for its remaining holders.
        state.cps.get_mut(cp_id).page = Some(new_slot);
        state.pages.get_mut(old_slot).ptr_count -= 1;
        debug_assert!(state.pages.get(old_slot).ptr_count > 0);

        state.bump_access(new_slot);
        state.add_to_evictable_unbacked(new_slot);
        state.reclassify_page(new_slot);
        debug!(block = %block_id, "cache.page_forked");
        new_slot
    }

    // ------------------------------------------------------------------
    // Acquirer surface, called from PageAcquirer
    // ------------------------------------------------------------------

    pub(crate) fn acq_release(&self, acq_id: AcqId) {
        self.state.lock().release_acquirer(acq_id);
    }

    pub(crate) fn acq_declare_snapshotted(&self, acq_id: AcqId) {
        self.state.lock().declare_snapshotted(acq_id);
    }

    pub(crate) fn acq_block_version(&self, acq_id: AcqId) -> crate::types::BlockVersion {
        self.state.lock().acqs.get(acq_id).block_version
    }

    pub(crate) fn acq_recency(&self, acq_id: AcqId) -> Recency {
        let state = self.state.lock();
        let acq = state.acqs.get(acq_id);
        if let Some(snapshot) = &acq.snapshot {
            return snapshot.recency;
        }
        state.recency_for_block(acq.block_id)
    }

    pub(crate) fn acq_set_recency(&self, acq_id: AcqId, recency: Recency) {
        let mut state = self.state.lock();
        let block_id = {
            let acq = state.acqs.get_mut(acq_id);
            assert_eq!(acq.access, Access::Write);
            acq.touched = true;
            acq.block_id
        };
        state.set_recency_for_block(block_id, recency);
    }

    pub(crate) fn acq_mark_deleted(&self, acq_id: AcqId) {
        let mut state = self.state.lock();
        let cp_id = {
            let acq = state.acqs.get_mut(acq_id);
            assert_eq!(acq.access, Access::Write);
            acq.dirtied = true;
            acq.cp
        };
        state.cp_mark_deleted(cp_id);
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            self.have_read_ahead_cb_destroyed(&mut state);
        }
        // Closing the channel drains the worker: queued flushes complete
        // before the thread exits.
        drop(self.flush_tx.lock().take());
        if let Some(worker) = self.flush_worker.lock().take() {
            let _ = worker.join();
        }
        let mut state = self.state.lock();
        for peer in state.peers.iter_mut() {
            peer.shutdown();
        }
        state.peers.clear();
    }
}
