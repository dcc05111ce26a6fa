//! Property tests: CDF construction laws, admit-set shape, and a
//! model-checked write/flush/evict/read workload.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rustc_hash::FxHashMap;

use nimbus::admission::{best_admit_set, Cdf, TierLatency};
use nimbus::{
    Access, BlockId, CacheConnection, CacheOptions, CacheRuntime, Config, FixedBalancer,
    LoopbackTransport, MemorySerializer, PageCache, RdmaTransport, Serializer, TxnThrottler,
};

const BLOCK_SIZE: u32 = 4096;

fn node() -> Arc<PageCache> {
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    let transport: Arc<dyn RdmaTransport> = LoopbackTransport::new();
    let runtime = CacheRuntime::new(
        Config::single_node("10.0.0.1", 6001, 7001),
        transport,
        FixedBalancer::new(1 << 20, false),
        TxnThrottler::new(256),
        CacheOptions {
            rdma_enabled: false,
            ..CacheOptions::default()
        },
    );
    PageCache::new(serializer as Arc<dyn Serializer>, runtime).expect("cache construction")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cdf_is_sorted_and_dense(
        window in proptest::collection::btree_map(1u64..128, 0u64..500, 0..40usize)
    ) {
        let freqs: FxHashMap<BlockId, u64> =
            window.iter().map(|(&id, &freq)| (BlockId(id), freq)).collect();
        let cdf = Cdf::build(&freqs);

        // Dense: every id from 1 to the highest observed appears once.
        let max_id = window.keys().max().copied().unwrap_or(0);
        prop_assert_eq!(cdf.len(), max_id as usize);

        // Sorted by frequency descending, id descending on ties.
        for pair in cdf.entries.windows(2) {
            prop_assert!(
                pair[0].freq > pair[1].freq
                    || (pair[0].freq == pair[1].freq && pair[0].block_id > pair[1].block_id)
            );
        }

        let total: u64 = cdf.entries.iter().map(|entry| entry.freq).sum();
        if total > 0 {
            prop_assert_eq!(cdf.entries.last().unwrap().percentile, 100);
        }
    }

    #[test]
    fn admit_set_is_a_prefix_of_the_cdf(
        window in proptest::collection::btree_map(1u64..64, 1u64..1000, 1..30usize),
        cache_size in 1u64..100,
    ) {
        let freqs: FxHashMap<BlockId, u64> =
            window.iter().map(|(&id, &freq)| (BlockId(id), freq)).collect();
        let cdf = Cdf::build(&freqs);
        let outcome = best_admit_set(&cdf, &TierLatency::default(), cache_size);

        prop_assert!(outcome.local_watermark <= cache_size as usize / 3);
        prop_assert_eq!(
            outcome.remote_watermark,
            (cache_size as usize).saturating_sub(3 * outcome.local_watermark)
        );
        prop_assert_eq!(
            outcome.admitted.len(),
            outcome.local_watermark.min(cdf.len())
        );
        for (index, entry) in outcome.admitted.iter().enumerate() {
            prop_assert_eq!(entry.block_id, cdf.entries[index].block_id);
        }
    }

    #[test]
    fn random_workload_round_trips(
        ops in proptest::collection::vec((10u64..22, any::<u8>()), 1..16)
    ) {
        let cache = node();
        let conn = CacheConnection::new(&cache);
        let mut model: BTreeMap<u64, u8> = BTreeMap::new();

        for (id, value) in ops {
            let txn = cache.begin_txn(Some(&conn));
            let acq = if model.contains_key(&id) {
                txn.acquire(BlockId(id), Access::Write).unwrap()
            } else {
                txn.create_chosen(BlockId(id)).unwrap()
            };
            acq.write_with(|buf| buf[0] = value).unwrap();
            drop(acq);
            cache.flush_and_destroy_txn(txn).wait();
            model.insert(id, value);
        }

        // Squeeze the cache; whatever gets evicted must reload intact.
        cache.update_memory_limit(BLOCK_SIZE as u64, 0, 0, false);
        let stats = cache.stats();
        prop_assert!(stats.in_memory_bytes <= BLOCK_SIZE as u64 * 16);

        for (&id, &value) in &model {
            let acq = cache.read_acquire(BlockId(id)).unwrap();
            let first = acq.read_with(|buf| buf[0]).unwrap();
            prop_assert_eq!(first, value);
        }
    }
}
