//! Block-id → pool-offset metadata rings.
//!
//! Each node owns one ring: a dense array of `i64` entries indexed by block
//! id, `-1` meaning "not cached here". The ring is a registered memory
//! region; peers poll the whole thing with one one-sided read every poll
//! interval and double-buffer the result so lookups always see a consistent
//! snapshot. Staleness is harmless: a stale offset or `-1` just degrades the
//! lookup to disk.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::Result;
use crate::rdma::{MemoryRegion, RemoteRegion};
use crate::types::BlockId;

pub const RING_ENTRY_ABSENT: i64 = -1;
const RING_ENTRY_BYTES: usize = std::mem::size_of::<i64>();

/// Default cadence of the background poll loop.
pub const RING_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The owner side of a ring.
pub struct MetadataRing {
    region: MemoryRegion,
    entries: usize,
}

impl MetadataRing {
    pub fn new(entries: usize) -> Self {
        let region = MemoryRegion::new(entries * RING_ENTRY_BYTES);
        let ring = MetadataRing { region, entries };
        for index in 0..entries {
            ring.store(index, RING_ENTRY_ABSENT);
        }
        ring
    }

    pub fn region(&self) -> MemoryRegion {
        self.region.clone()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    fn store(&self, index: usize, value: i64) {
        // The region is sized for `entries`, so this cannot go out of
        // bounds.
        self.region
            .write_at((index * RING_ENTRY_BYTES) as u64, &value.to_le_bytes())
            .expect("ring entry within region");
    }

    /// Publishes the pool offset of a cached block. Ids beyond the ring are
    /// ignored; only the metadata id space is discoverable by peers.
    pub fn publish(&self, id: BlockId, offset: u64) {
        if let Some(index) = self.index_of(id) {
            self.store(index, offset as i64);
        }
    }

    pub fn withdraw(&self, id: BlockId) {
        if let Some(index) = self.index_of(id) {
            self.store(index, RING_ENTRY_ABSENT);
        }
    }

    pub fn entry(&self, id: BlockId) -> i64 {
        match self.index_of(id) {
            Some(index) => {
                let mut buf = [0u8; RING_ENTRY_BYTES];
                self.region
                    .read_at((index * RING_ENTRY_BYTES) as u64, &mut buf)
                    .expect("ring entry within region");
                i64::from_le_bytes(buf)
            }
            None => RING_ENTRY_ABSENT,
        }
    }

    fn index_of(&self, id: BlockId) -> Option<usize> {
        if id.is_null() || id.is_aux() {
            return None;
        }
        let index = id.0 as usize;
        (index < self.entries).then_some(index)
    }
}

/// A peer's view of one remote ring: the latest polled snapshot.
pub struct RingMirror {
    snapshot: Mutex<Arc<Vec<i64>>>,
    entries: usize,
}

impl RingMirror {
    pub fn new(entries: usize) -> Self {
        RingMirror {
            snapshot: Mutex::new(Arc::new(vec![RING_ENTRY_ABSENT; entries])),
            entries,
        }
    }

    /// Remote pool offset of a block, if the last snapshot lists one.
    /// Entry zero is also treated as absent: offset 0 doubles as the ring
    /// owner's scratch slot and a zero read of a torn snapshot must not
    /// direct traffic at it.
    pub fn lookup(&self, id: BlockId) -> Option<u64> {
        if id.is_null() || id.is_aux() {
            return None;
        }
        let snapshot = self.snapshot.lock().clone();
        let entry = *snapshot.get(id.0 as usize)?;
        (entry != RING_ENTRY_ABSENT && entry != 0).then(|| entry as u64)
    }

    pub fn swap(&self, next: Vec<i64>) {
        debug_assert_eq!(next.len(), self.entries);
        *self.snapshot.lock() = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<i64>> {
        self.snapshot.lock().clone()
    }

    /// Number of entries currently advertised as present.
    pub fn present_count(&self) -> usize {
        self.snapshot
            .lock()
            .iter()
            .filter(|&&e| e != RING_ENTRY_ABSENT && e != 0)
            .count()
    }
}

/// Background poller for one remote ring.
///
/// Reads the full ring into a scratch buffer, decodes, swaps the mirror.
/// Read failures are logged at debug and retried next tick; the peer coming
/// back simply makes the next poll succeed.
pub struct RingPoller {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RingPoller {
    pub fn spawn(
        remote: Box<dyn RemoteRegion>,
        mirror: Arc<RingMirror>,
        interval: Duration,
    ) -> RingPoller {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(format!("ring-poll-{}", remote.remote_host()))
            .spawn(move || {
                let entries = remote.len() / RING_ENTRY_BYTES;
                let mut raw = vec![0u8; entries * RING_ENTRY_BYTES];
                while !stop.load(Ordering::Acquire) {
                    match remote.read(&mut raw, 0) {
                        Ok(()) => {
                            let decoded = raw
                                .chunks_exact(RING_ENTRY_BYTES)
                                .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()))
                                .collect();
                            mirror.swap(decoded);
                            trace!(host = remote.remote_host(), "metadata.ring.polled");
                        }
                        Err(err) => {
                            debug!(
                                host = remote.remote_host(),
                                error = %err,
                                "metadata.ring.poll_failed"
                            );
                        }
                    }
                    thread::sleep(interval);
                }
            })
            .expect("spawn ring poller");
        RingPoller {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RingPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A remote node as seen from this one: its polled metadata mirror and the
/// queue pair into its page pool.
pub struct Peer {
    pub host: String,
    pub mirror: Arc<RingMirror>,
    pub pool: Box<dyn RemoteRegion>,
    poller: RingPoller,
}

impl Peer {
    pub fn new(
        host: String,
        ring_qp: Box<dyn RemoteRegion>,
        pool_qp: Box<dyn RemoteRegion>,
        entries: usize,
        poll_interval: Duration,
    ) -> Result<Peer> {
        let mirror = Arc::new(RingMirror::new(entries));
        let poller = RingPoller::spawn(ring_qp, Arc::clone(&mirror), poll_interval);
        Ok(Peer {
            host,
            mirror,
            pool: pool_qp,
            poller,
        })
    }

    pub fn shutdown(&mut self) {
        self.poller.stop();
    }
}
