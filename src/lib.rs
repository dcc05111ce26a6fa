//! nimbus — a distributed, RDMA-aware buffer cache for a block-oriented
//! storage engine.
//!
//! The cache serves reads from three tiers: the local current-page maps,
//! remote peers discovered through polled metadata rings and fetched with
//! one-sided reads, and the serializer on disk. Writes are local-only and
//! flow through a transaction DAG whose maximal flushable sets land in
//! single atomic index writes. An eviction engine keeps residency under the
//! balancer-assigned budget, and a CDF cost model decides which remote
//! blocks are worth keeping.

pub mod admission;
pub mod balancer;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod rdma;
pub mod runtime;
pub mod serializer;
pub mod throttler;
pub mod types;

mod acquirer;
mod arena;
mod cache;
mod current;
mod dump;
mod evict;
mod flush;
mod page;
mod signal;
mod txn;

pub use crate::acquirer::PageAcquirer;
pub use crate::balancer::{CacheBalancer, FixedBalancer};
pub use crate::cache::{BlockInfo, CacheStatsSnapshot, PageCache};
pub use crate::config::{Config, HostConfig};
pub use crate::current::Access;
pub use crate::error::{CacheError, Result};
pub use crate::metadata::{MetadataRing, RingMirror};
pub use crate::rdma::{LoopbackTransport, MemoryRegion, RdmaTransport};
pub use crate::runtime::{CacheOptions, CacheRuntime};
pub use crate::serializer::{BlockToken, IoAccount, MemorySerializer, Serializer};
pub use crate::throttler::TxnThrottler;
pub use crate::txn::{CacheConnection, FlushHandle, PageTxn};
pub use crate::types::{BlockId, BlockType, BlockVersion, Recency, NULL_BLOCK_ID};
