//! CDF-based admission.
//!
//! Frequencies accumulated over a window are sorted into a CDF, and the
//! cost model scans candidate local/remote watermark splits against the
//! measured tier latencies. Keeping a block locally consumes three units of
//! the budget (it displaces a remotely cacheable block on every peer), so
//! the local watermark caps at a third of the cache. The block ids below the
//! winning local watermark become the admit set.

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::info;

use crate::types::{BlockId, MAX_DISK_READ_BEFORE_ADMIT};

/// Estimated per-access latencies of the three tiers, in nanoseconds.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct TierLatency {
    pub cache_ns: u64,
    pub disk_ns: u64,
    pub rdma_ns: u64,
}

impl Default for TierLatency {
    fn default() -> Self {
        TierLatency {
            cache_ns: 1_000,
            disk_ns: 100_000,
            rdma_ns: 5_000,
        }
    }
}

/// Fallback RDMA estimate while the latency window is empty.
const RDMA_LATENCY_FALLBACK_NS: u64 = 10_000;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CdfEntry {
    pub freq: u64,
    pub block_id: BlockId,
    pub percentile: u64,
}

/// Frequency CDF over one admission window.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Cdf {
    pub entries: Vec<CdfEntry>,
    /// Cumulative frequency aligned with `entries`.
    cumulative: Vec<u64>,
}

impl Cdf {
    /// Builds the CDF: every id from 1 to the highest observed appears, the
    /// unobserved ones with frequency zero; sorted by frequency descending,
    /// block id descending as the tie-break; percentile is the entry's
    /// share of cumulative frequency.
    pub fn build(freqs: &FxHashMap<BlockId, u64>) -> Cdf {
        let max_id = freqs.keys().map(|id| id.0).max().unwrap_or(0);
        let mut pairs: Vec<(u64, BlockId)> = Vec::with_capacity(max_id as usize);
        for id in 1..=max_id {
            let block_id = BlockId(id);
            pairs.push((freqs.get(&block_id).copied().unwrap_or(0), block_id));
        }
        pairs.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let total: u64 = pairs.iter().map(|(freq, _)| freq).sum();
        let mut entries = Vec::with_capacity(pairs.len());
        let mut cumulative = Vec::with_capacity(pairs.len());
        let mut running = 0u64;
        for (freq, block_id) in pairs {
            running += freq;
            let percentile = if total > 0 { running * 100 / total } else { 0 };
            entries.push(CdfEntry {
                freq,
                block_id,
                percentile,
            });
            cumulative.push(running);
        }
        Cdf {
            entries,
            cumulative,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of frequencies over the half-open index range `[start, end)`.
    fn range_freq(&self, start: usize, end: usize) -> u64 {
        let end = end.min(self.len());
        let start = start.min(end);
        if start == end {
            return 0;
        }
        let below = if start == 0 {
            0
        } else {
            self.cumulative[start - 1]
        };
        self.cumulative[end - 1] - below
    }

    /// Expected total latency of serving the window with the hottest
    /// `local` blocks cached here, the next `remote` reachable over RDMA,
    /// and the tail on disk.
    fn expected_latency(&self, local: usize, remote: usize, latency: &TierLatency) -> u64 {
        let rdma_ns = if latency.rdma_ns == 0 {
            RDMA_LATENCY_FALLBACK_NS
        } else {
            latency.rdma_ns
        };
        self.range_freq(0, local) * latency.cache_ns
            + self.range_freq(local, local + remote) * rdma_ns
            + self.range_freq(local + remote, self.len()) * latency.disk_ns
    }
}

/// Result of one admission recompute.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AdmitOutcome {
    pub local_watermark: usize,
    pub remote_watermark: usize,
    pub admitted: Vec<CdfEntry>,
}

/// Scans candidate splits and returns the cost-optimal admit set.
///
/// Candidates are `local ∈ [0, cache_size/3]` with
/// `remote = cache_size − 3·local`; the scan skips the empty-local split
/// while the window carries any traffic (an admit set that keeps nothing
/// local starves the cache for a whole refresh period). Smallest expected
/// latency wins.
pub fn best_admit_set(cdf: &Cdf, latency: &TierLatency, cache_size_blocks: u64) -> AdmitOutcome {
    let cache_size = cache_size_blocks as usize;
    let max_local = cache_size / 3;
    let has_traffic = cdf.entries.iter().any(|e| e.freq > 0);
    let floor = if has_traffic && max_local >= 1 { 1 } else { 0 };

    let mut best_local = floor.min(max_local);
    let mut best_cost = u64::MAX;
    for local in floor..=max_local {
        let remote = cache_size.saturating_sub(3 * local);
        let cost = cdf.expected_latency(local, remote, latency);
        if cost < best_cost {
            best_cost = cost;
            best_local = local;
        }
    }
    let best_remote = cache_size.saturating_sub(3 * best_local);

    let admitted: Vec<CdfEntry> = cdf.entries.iter().take(best_local).copied().collect();
    info!(
        local = best_local,
        remote = best_remote,
        cost = best_cost,
        window = cdf.len(),
        "admission.recompute"
    );
    AdmitOutcome {
        local_watermark: best_local,
        remote_watermark: best_remote,
        admitted,
    }
}

/// Admission state carried by a shard between recomputes.
#[derive(Default)]
pub struct AdmissionState {
    pub latency: TierLatency,
    pub cdf: Cdf,
    pub outcome: AdmitOutcome,
    admit: FxHashMap<BlockId, u64>,
}

impl AdmissionState {
    pub fn new(latency: TierLatency) -> AdmissionState {
        AdmissionState {
            latency,
            ..AdmissionState::default()
        }
    }

    /// Whether the CDF model currently has this block on the admit list.
    pub fn can_admit(&self, id: BlockId) -> bool {
        self.admit.contains_key(&id)
    }

    pub fn admit_set(&self) -> &FxHashMap<BlockId, u64> {
        &self.admit
    }

    /// Fast-path admit: a block read from disk this often within one window
    /// is worth keeping regardless of the cost model.
    pub fn hot_enough(disk_reads: u64) -> bool {
        disk_reads > MAX_DISK_READ_BEFORE_ADMIT
    }

    /// Recomputes the CDF and admit set from the window's frequencies. The
    /// caller clears the frequency window afterwards.
    pub fn recompute(&mut self, freqs: &FxHashMap<BlockId, u64>, cache_size_blocks: u64) {
        self.cdf = Cdf::build(freqs);
        self.outcome = best_admit_set(&self.cdf, &self.latency, cache_size_blocks);
        self.admit = self
            .outcome
            .admitted
            .iter()
            .map(|entry| (entry.block_id, entry.freq))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freqs(pairs: &[(u64, u64)]) -> FxHashMap<BlockId, u64> {
        pairs.iter().map(|&(id, f)| (BlockId(id), f)).collect()
    }

    #[test]
    fn cdf_orders_by_freq_then_id_and_fills_gaps() {
        let cdf = Cdf::build(&freqs(&[(2, 10), (5, 10), (7, 3)]));
        // Ids 1..=7 all present; freq ties broken by descending id.
        assert_eq!(cdf.len(), 7);
        assert_eq!(cdf.entries[0].block_id, BlockId(5));
        assert_eq!(cdf.entries[1].block_id, BlockId(2));
        assert_eq!(cdf.entries[2].block_id, BlockId(7));
        assert_eq!(cdf.entries[2].percentile, 100);
        // Zero-frequency gaps come last, id descending.
        assert_eq!(cdf.entries[3].freq, 0);
        assert_eq!(cdf.entries[3].block_id, BlockId(6));
        assert_eq!(cdf.entries[6].block_id, BlockId(1));
    }

    #[test]
    fn range_freq_is_half_open_and_clamped() {
        let cdf = Cdf::build(&freqs(&[(1, 100), (2, 50), (3, 25), (4, 10)]));
        assert_eq!(cdf.range_freq(0, 1), 100);
        assert_eq!(cdf.range_freq(1, 1), 0);
        assert_eq!(cdf.range_freq(1, 4), 85);
        assert_eq!(cdf.range_freq(2, 99), 35);
    }

    #[test]
    fn boundary_split_admits_hottest_block() {
        // Small cache: the only non-degenerate split is the cache_size/3
        // boundary, and it must admit the top of the CDF.
        let latency = TierLatency {
            cache_ns: 1_000,
            disk_ns: 100_000,
            rdma_ns: 5_000,
        };
        let cdf = Cdf::build(&freqs(&[(1, 100), (2, 50), (3, 25), (4, 10)]));
        let outcome = best_admit_set(&cdf, &latency, 3);
        assert_eq!(outcome.local_watermark, 1);
        assert_eq!(outcome.remote_watermark, 0);
        assert_eq!(outcome.admitted.len(), 1);
        assert_eq!(outcome.admitted[0].block_id, BlockId(1));
    }

    #[test]
    fn empty_window_admits_nothing() {
        let cdf = Cdf::build(&FxHashMap::default());
        let outcome = best_admit_set(&cdf, &TierLatency::default(), 300);
        assert_eq!(outcome.local_watermark, 0);
        assert!(outcome.admitted.is_empty());
    }

    #[test]
    fn wide_cache_prefers_cheaper_local_tier() {
        // With a wide cache and an expensive fabric, the scan should push
        // the local watermark up toward its cap.
        let latency = TierLatency {
            cache_ns: 1_000,
            disk_ns: 100_000,
            rdma_ns: 90_000,
        };
        let window: Vec<(u64, u64)> = (1..=30).map(|id| (id, 1000 / id)).collect();
        let cdf = Cdf::build(&freqs(&window));
        let outcome = best_admit_set(&cdf, &latency, 30);
        assert_eq!(outcome.local_watermark, 10);
        assert_eq!(outcome.admitted.len(), 10);
    }

    #[test]
    fn zero_rdma_estimate_uses_fallback() {
        let latency = TierLatency {
            cache_ns: 1_000,
            disk_ns: 100_000,
            rdma_ns: 0,
        };
        let cdf = Cdf::build(&freqs(&[(1, 10), (2, 5)]));
        // Must not divide the world by a zero-latency fabric.
        let outcome = best_admit_set(&cdf, &latency, 6);
        assert!(outcome.local_watermark >= 1);
    }

    #[test]
    fn admission_state_round_trip() {
        let mut state = AdmissionState::new(TierLatency::default());
        assert!(!state.can_admit(BlockId(1)));
        state.recompute(&freqs(&[(1, 100), (2, 50), (3, 25), (4, 10)]), 3);
        assert!(state.can_admit(BlockId(1)));
        assert!(!state.can_admit(BlockId(2)));
        assert!(AdmissionState::hot_enough(MAX_DISK_READ_BEFORE_ADMIT + 1));
        assert!(!AdmissionState::hot_enough(MAX_DISK_READ_BEFORE_ADMIT));
    }
}
