//! The eviction engine.
//!
//! Pages are partitioned into five bags; membership is a pure function of
//! page state. The eviction loop drains the disk-backed evictable bag while
//! memory exceeds the limit, and a write-biased sweep clears settled
//! write-shard pages once that bag grows past a threshold. The loop is flat:
//! hooks that fire mid-eviction hit the re-entrancy guard instead of
//! recursing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::balancer::CacheBalancer;
use crate::cache::ShardState;
use crate::page::{BagKind, Page, PageSlotId, BAG_COUNT};

/// Access-time distance a page must fall behind the global counter before
/// the oldish selector will take it.
pub(crate) const EVICTION_ACCESS_HYSTERESIS: u64 = 16;

/// Access-time counter starting value, kept well clear of zero so the
/// hysteresis subtraction never wraps noticeably.
pub(crate) const INITIAL_ACCESS_TIME: u64 = 1_000_000;

/// Disk-backed bag occupancy above which the write-biased sweep runs.
pub(crate) const WRITE_SWEEP_THRESHOLD: usize = 25;

/// One category of pages: O(1) add, O(1) remove through the page's
/// back-index, O(1) random access, and an aggregate byte counter.
#[derive(Default)]
pub(crate) struct EvictionBag {
    pub(crate) pages: Vec<PageSlotId>,
    pub(crate) bytes: u64,
}

impl EvictionBag {
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }
}

pub(crate) struct Evicter {
    pub(crate) memory_limit: u64,
    pub(crate) bytes_loaded_counter: i64,
    pub(crate) access_count_counter: u64,
    pub(crate) access_time_counter: u64,
    pub(crate) evict_active: bool,
    pub(crate) bags: [EvictionBag; BAG_COUNT],
    pub(crate) balancer: Arc<dyn CacheBalancer>,
    pub(crate) balancer_activity_flag: Arc<AtomicBool>,
}

impl Evicter {
    pub(crate) fn new(memory_limit: u64, balancer: Arc<dyn CacheBalancer>) -> Evicter {
        let balancer_activity_flag = balancer.activity_flag();
        balancer.add_evicter();
        Evicter {
            memory_limit,
            bytes_loaded_counter: 0,
            access_count_counter: 0,
            access_time_counter: INITIAL_ACCESS_TIME,
            evict_active: false,
            bags: Default::default(),
            balancer,
            balancer_activity_flag,
        }
    }

    pub(crate) fn bag(&self, kind: BagKind) -> &EvictionBag {
        &self.bags[kind.index()]
    }

    pub(crate) fn bag_mut(&mut self, kind: BagKind) -> &mut EvictionBag {
        &mut self.bags[kind.index()]
    }

    /// Bytes of resident pages the limit applies to. The evicted bag holds
    /// no buffers; RDMA-sourced pages are accounted by their owner.
    pub(crate) fn in_memory_size(&self) -> u64 {
        self.bag(BagKind::Unevictable).bytes
            + self.bag(BagKind::EvictableDiskBacked).bytes
            + self.bag(BagKind::EvictableUnbacked).bytes
    }

    pub(crate) fn next_access_time(&mut self) -> u64 {
        self.access_time_counter += 1;
        self.access_time_counter
    }
}

impl Drop for Evicter {
    fn drop(&mut self) {
        self.balancer.remove_evicter();
    }
}

/// The correct bag for a page's current state. Pure; `in_local_map` is
/// whether the page's block id is served from a local current-page map
/// (primary or write shard). A disk-backed page that is not locally mapped
/// only exists for remote consumption and is accounted with the
/// RDMA-sourced pages.
pub(crate) fn correct_bag(page: &Page, in_local_map: bool) -> BagKind {
    if page.is_rdma {
        BagKind::Rdma
    } else if page.is_loading() || page.has_waiters() {
        BagKind::Unevictable
    } else if !page.is_loaded() {
        BagKind::Evicted
    } else if page.is_disk_backed() {
        if in_local_map {
            BagKind::EvictableDiskBacked
        } else {
            BagKind::Rdma
        }
    } else {
        BagKind::EvictableUnbacked
    }
}

impl ShardState {
    fn page_in_local_map(&self, slot: PageSlotId) -> bool {
        let block_id = self.pages.get(slot).block_id;
        self.current_pages.contains_key(&block_id) || self.write_pages.contains_key(&block_id)
    }

    pub(crate) fn bag_add(&mut self, kind: BagKind, slot: PageSlotId) {
        let usage = self.pages.get(slot).hypothetical_memory_usage();
        let bag = self.evicter.bag_mut(kind);
        let index = bag.pages.len();
        bag.pages.push(slot);
        bag.bytes += usage;
        let page = self.pages.get_mut(slot);
        debug_assert!(page.bag.is_none(), "page already in a bag");
        page.bag = Some(kind);
        page.bag_index = index;
        page.debug_invariants();
    }

    pub(crate) fn bag_remove(&mut self, slot: PageSlotId) {
        let (kind, index, usage) = {
            let page = self.pages.get(slot);
            (
                page.bag.expect("page not in any bag"),
                page.bag_index,
                page.hypothetical_memory_usage(),
            )
        };
        let bag = self.evicter.bag_mut(kind);
        debug_assert_eq!(bag.pages[index], slot);
        bag.pages.swap_remove(index);
        bag.bytes -= usage;
        if index < bag.pages.len() {
            let moved = bag.pages[index];
            self.pages.get_mut(moved).bag_index = index;
        }
        self.pages.get_mut(slot).bag = None;
    }

    /// Moves a page to whatever bag its state now calls for, then runs the
    /// eviction loop. RDMA-sourced pages stay in the RDMA bag for life.
    pub(crate) fn reclassify_page(&mut self, slot: PageSlotId) {
        if self.pages.get(slot).is_rdma {
            self.evict_if_necessary();
            return;
        }
        let target = correct_bag(self.pages.get(slot), self.page_in_local_map(slot));
        if self.pages.get(slot).bag != Some(target) {
            if self.pages.get(slot).bag.is_some() {
                self.bag_remove(slot);
            }
            self.bag_add(target, slot);
        }
        self.evict_if_necessary();
    }

    /// A brand-new page whose load is starting right now: unevictable
    /// until the read completes, and counted as loading bytes.
    pub(crate) fn add_not_yet_loaded(&mut self, slot: PageSlotId) {
        let usage = self.pages.get(slot).hypothetical_memory_usage() as i64;
        self.bag_add(BagKind::Unevictable, slot);
        self.evict_if_necessary();
        self.notify_bytes_loading(usage);
    }

    /// A page constructed without loading (snapshot captures, deferred
    /// reads). It carries no bytes yet, so it sits with the evicted pages
    /// and is not counted as loading.
    pub(crate) fn add_deferred_loaded(&mut self, slot: PageSlotId) {
        self.bag_add(BagKind::Evicted, slot);
    }

    /// A previously evicted or deferred page whose load is starting:
    /// reclassifies (to unevictable) and counts the incoming bytes.
    pub(crate) fn reloading_page(&mut self, slot: PageSlotId) {
        let usage = self.pages.get(slot).hypothetical_memory_usage() as i64;
        self.reclassify_page(slot);
        self.notify_bytes_loading(usage);
    }

    pub(crate) fn add_to_evictable_disk_backed(&mut self, slot: PageSlotId) {
        let usage = self.pages.get(slot).hypothetical_memory_usage() as i64;
        self.bag_add(BagKind::EvictableDiskBacked, slot);
        self.evict_if_necessary();
        self.notify_bytes_loading(usage);
    }

    pub(crate) fn add_to_evictable_unbacked(&mut self, slot: PageSlotId) {
        let usage = self.pages.get(slot).hypothetical_memory_usage() as i64;
        self.bag_add(BagKind::EvictableUnbacked, slot);
        self.evict_if_necessary();
        self.notify_bytes_loading(usage);
    }

    /// RDMA-sourced pages are remote-owned memory; they join their bag
    /// without counting toward loaded bytes.
    pub(crate) fn add_to_evictable_rdma(&mut self, slot: PageSlotId) {
        self.bag_add(BagKind::Rdma, slot);
        self.evict_if_necessary();
    }

    /// Removes a dying page from its bag.
    pub(crate) fn remove_page(&mut self, slot: PageSlotId) {
        self.bag_remove(slot);
        self.evict_if_necessary();
    }

    /// Explicit unevictable → evictable transition, used when the condition
    /// keeping a page pinned (its load, its waiters) has cleared.
    pub(crate) fn move_unevictable_to_evictable(&mut self, slot: PageSlotId) {
        debug_assert_eq!(self.pages.get(slot).bag, Some(BagKind::Unevictable));
        let target = correct_bag(self.pages.get(slot), self.page_in_local_map(slot));
        debug_assert!(
            matches!(
                target,
                BagKind::EvictableDiskBacked | BagKind::EvictableUnbacked
            ),
            "page still unevictable"
        );
        self.bag_remove(slot);
        self.bag_add(target, slot);
        self.evict_if_necessary();
    }

    /// Bumps the load counters and runs the balancer handshake: if the
    /// notify-me flag is armed, disarm it and post one activity message to
    /// the balancer's inbox.
    pub(crate) fn notify_bytes_loading(&mut self, in_memory_buf_change: i64) {
        self.evicter.bytes_loaded_counter += in_memory_buf_change;
        self.evicter.access_count_counter += 1;
        if self
            .evicter
            .balancer_activity_flag
            .swap(false, Ordering::AcqRel)
        {
            self.evicter.balancer.wake_up_activity_happened();
        }
    }

    pub(crate) fn bump_access(&mut self, slot: PageSlotId) {
        let time = self.evicter.next_access_time();
        self.pages.get_mut(slot).access_time = time;
    }

    /// The eviction loop. Guarded against re-entrancy: hooks reached from
    /// inside the loop (bag removals, current-page teardown) call back in
    /// and must not start a nested loop.
    pub(crate) fn evict_if_necessary(&mut self) {
        if self.evicter.evict_active {
            return;
        }
        self.evicter.evict_active = true;

        while self.evicter.in_memory_size() > self.evicter.memory_limit {
            let victim = match self.pick_oldish_victim() {
                Some(victim) => victim,
                None => break,
            };
            let block_id = self.pages.get(victim).block_id;
            debug!(block = %block_id, "evict.victim");
            self.evict_page(victim);
            self.consider_evicting_current_page(block_id);
        }
        if self.options.write_shard_enabled {
            self.evict_writes();
        }

        self.evicter.evict_active = false;
    }

    /// Oldest eligible page in the disk-backed evictable bag: last access
    /// strictly below the counter minus the hysteresis. Pages whose bytes
    /// are someone's only copy (no token, extra references) are not
    /// candidates.
    fn pick_oldish_victim(&self) -> Option<PageSlotId> {
        let cutoff = self
            .evicter
            .access_time_counter
            .saturating_sub(EVICTION_ACCESS_HYSTERESIS);
        let bag = self.evicter.bag(BagKind::EvictableDiskBacked);
        let mut best: Option<(u64, PageSlotId)> = None;
        for &slot in &bag.pages {
            let page = self.pages.get(slot);
            if page.is_rdma {
                continue;
            }
            if page.access_time >= cutoff {
                continue;
            }
            if page.token.is_none() && page.ptr_count > 1 {
                continue;
            }
            if best.map_or(true, |(time, _)| page.access_time < time) {
                best = Some((page.access_time, slot));
            }
        }
        best.map(|(_, slot)| slot)
    }

    /// Drops a page's buffer. With a block token the page moves to the
    /// evicted bag and can be reloaded; without one there is nothing to
    /// reload, so the page leaves its current-page entirely.
    pub(crate) fn evict_page(&mut self, slot: PageSlotId) {
        self.release_page_buffer(slot);
        if self.pages.get(slot).token.is_some() {
            self.pages.get_mut(slot).state = crate::page::LoadState::Evicted;
            self.reclassify_page(slot);
        } else {
            self.pages.get_mut(slot).state = crate::page::LoadState::NotLoaded;
            self.bag_remove(slot);
            let block_id = self.pages.get(slot).block_id;
            self.detach_page_from_current(block_id, slot);
        }
    }

    /// Unlinks `slot` from whichever current-page owns it and drops that
    /// reference.
    fn detach_page_from_current(&mut self, block_id: crate::types::BlockId, slot: PageSlotId) {
        let cp_id = self
            .current_pages
            .get(&block_id)
            .or_else(|| self.write_pages.get(&block_id))
            .or_else(|| self.rdma_pages.get(&block_id))
            .copied();
        if let Some(cp_id) = cp_id {
            if self.cps.get(cp_id).page == Some(slot) {
                self.cps.get_mut(cp_id).page = None;
                self.page_unref(slot);
            }
        }
    }

    /// Write-biased sweep: once the disk-backed bag is crowded, settled
    /// write-shard pages go first regardless of age. They were created by
    /// writes, have been flushed, and can be re-read from disk.
    fn evict_writes(&mut self) {
        if self.evicter.bag(BagKind::EvictableDiskBacked).len() <= WRITE_SWEEP_THRESHOLD {
            return;
        }
        let candidates: Vec<PageSlotId> = self
            .evicter
            .bag(BagKind::EvictableDiskBacked)
            .pages
            .clone();
        let mut swept = 0usize;
        for slot in candidates {
            if !self.pages.contains(slot) {
                continue;
            }
            let page = self.pages.get(slot);
            if page.bag != Some(BagKind::EvictableDiskBacked) || !page.is_write {
                continue;
            }
            let block_id = page.block_id;
            self.evict_page(slot);
            self.erase_write_page_for_block_id(block_id);
            swept += 1;
        }
        if swept > 0 {
            debug!(swept, "evict.write_sweep");
        }
    }

    pub(crate) fn log_bag_occupancy(&self) {
        let evicter = &self.evicter;
        info!(
            rdma = evicter.bag(BagKind::Rdma).len(),
            unevictable = evicter.bag(BagKind::Unevictable).len(),
            evicted = evicter.bag(BagKind::Evicted).len(),
            disk_backed = evicter.bag(BagKind::EvictableDiskBacked).len(),
            unbacked = evicter.bag(BagKind::EvictableUnbacked).len(),
            in_memory = evicter.in_memory_size(),
            limit = evicter.memory_limit,
            "evict.bag_occupancy"
        );
    }
}
