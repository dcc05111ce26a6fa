//! Explicitly constructed runtime context.
//!
//! Everything a shard needs from the outside world — peer configuration,
//! the transport, the balancer, the throttler, and tunables — is owned by
//! one `CacheRuntime` object the outer service builds and hands to each
//! cache by reference. No global state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::CacheBalancer;
use crate::config::Config;
use crate::metadata::RING_POLL_INTERVAL;
use crate::rdma::RdmaTransport;
use crate::throttler::TxnThrottler;

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Page-pool capacity in slots; derived from the memory budget when
    /// unset.
    pub pool_slots: Option<u32>,
    /// Whether lookups consult remote peers at all.
    pub rdma_enabled: bool,
    /// Whether freshly created blocks go to the dedicated write shard.
    pub write_shard_enabled: bool,
    /// Operations between admission recomputes (and window resets).
    pub admission_refresh_ops: u64,
    pub ring_poll_interval: Duration,
    /// When set, periodic debug dumps are written here, one file set per
    /// epoch.
    pub dump_dir: Option<PathBuf>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            pool_slots: None,
            rdma_enabled: true,
            write_shard_enabled: true,
            admission_refresh_ops: 1_000_000,
            ring_poll_interval: RING_POLL_INTERVAL,
            dump_dir: None,
        }
    }
}

pub struct CacheRuntime {
    pub config: Config,
    pub transport: Arc<dyn RdmaTransport>,
    pub balancer: Arc<dyn CacheBalancer>,
    pub throttler: Arc<TxnThrottler>,
    pub options: CacheOptions,
}

impl CacheRuntime {
    pub fn new(
        config: Config,
        transport: Arc<dyn RdmaTransport>,
        balancer: Arc<dyn CacheBalancer>,
        throttler: Arc<TxnThrottler>,
        options: CacheOptions,
    ) -> Arc<CacheRuntime> {
        Arc::new(CacheRuntime {
            config,
            transport,
            balancer,
            throttler,
            options,
        })
    }
}
