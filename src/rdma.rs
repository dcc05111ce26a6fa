//! One-sided transport primitives.
//!
//! The cache needs exactly two things from its fabric: registering a local
//! memory region under a (host, port) endpoint, and one-sided reads from a
//! connected remote region. Real deployments plug a verbs-backed transport
//! in here; [`LoopbackTransport`] wires endpoints together in-process and
//! can fail links on demand, which is what the tier fall-through tests run
//! against.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{CacheError, Result};

/// A registered, remotely readable memory region.
///
/// Shared buffer; the owner writes through [`MemoryRegion::write_at`], remote
/// queue pairs read snapshots of byte ranges.
#[derive(Clone)]
pub struct MemoryRegion {
    bytes: Arc<RwLock<Box<[u8]>>>,
}

impl MemoryRegion {
    pub fn new(size: usize) -> Self {
        MemoryRegion {
            bytes: Arc::new(RwLock::new(vec![0u8; size].into_boxed_slice())),
        }
    }

    pub fn with_fill(size: usize, fill: u8) -> Self {
        MemoryRegion {
            bytes: Arc::new(RwLock::new(vec![fill; size].into_boxed_slice())),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = offset as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(CacheError::RingBounds(offset))?;
        if end > bytes.len() {
            return Err(CacheError::RingBounds(offset));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    pub fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(CacheError::RingBounds(offset))?;
        if end > bytes.len() {
            return Err(CacheError::RingBounds(offset));
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }
}

/// Token naming a registered region on this node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionToken(pub u64);

/// A connected queue pair scoped to one remote region.
pub trait RemoteRegion: Send + Sync {
    /// One-sided read of `dst.len()` bytes at `remote_offset`.
    fn read(&self, dst: &mut [u8], remote_offset: u64) -> Result<()>;

    fn len(&self) -> usize;

    fn remote_host(&self) -> &str;
}

pub trait RdmaTransport: Send + Sync {
    /// Exposes `region` for one-sided reads under `(host, port)`.
    fn register_memory(&self, host: &str, port: u16, region: MemoryRegion) -> Result<RegionToken>;

    /// Connects to a remote endpoint, returning a queue pair bound to the
    /// region registered there.
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn RemoteRegion>>;
}

/// In-process fabric: endpoints are a shared registry, reads are memcpys.
/// Links to a host can be taken down to exercise transport-fault paths.
pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
}

struct LoopbackState {
    endpoints: Mutex<FxHashMap<(String, u16), MemoryRegion>>,
    down_hosts: Mutex<HashSet<String>>,
    next_token: Mutex<u64>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackTransport {
            state: Arc::new(LoopbackState {
                endpoints: Mutex::new(FxHashMap::default()),
                down_hosts: Mutex::new(HashSet::new()),
                next_token: Mutex::new(1),
            }),
        })
    }

    /// Severs every queue pair toward `host` until the link is restored.
    /// In-flight and future reads fail with a transport error.
    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut hosts = self.state.down_hosts.lock();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        LoopbackTransport {
            state: Arc::new(LoopbackState {
                endpoints: Mutex::new(FxHashMap::default()),
                down_hosts: Mutex::new(HashSet::new()),
                next_token: Mutex::new(1),
            }),
        }
    }
}

impl RdmaTransport for LoopbackTransport {
    fn register_memory(&self, host: &str, port: u16, region: MemoryRegion) -> Result<RegionToken> {
        let mut endpoints = self.state.endpoints.lock();
        endpoints.insert((host.to_string(), port), region);
        let mut next = self.state.next_token.lock();
        let token = RegionToken(*next);
        *next += 1;
        Ok(token)
    }

    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn RemoteRegion>> {
        let endpoints = self.state.endpoints.lock();
        let region = endpoints
            .get(&(host.to_string(), port))
            .cloned()
            .ok_or_else(|| CacheError::Transport(format!("no endpoint at {host}:{port}")))?;
        Ok(Box::new(LoopbackQueuePair {
            host: host.to_string(),
            region,
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackQueuePair {
    host: String,
    region: MemoryRegion,
    state: Arc<LoopbackState>,
}

impl RemoteRegion for LoopbackQueuePair {
    fn read(&self, dst: &mut [u8], remote_offset: u64) -> Result<()> {
        if self.state.down_hosts.lock().contains(&self.host) {
            return Err(CacheError::Transport(format!(
                "link to {} is down",
                self.host
            )));
        }
        self.region.read_at(remote_offset, dst)
    }

    fn len(&self) -> usize {
        self.region.len()
    }

    fn remote_host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_bounds_are_checked() {
        let region = MemoryRegion::new(8);
        let mut buf = [0u8; 4];
        assert!(region.read_at(0, &mut buf).is_ok());
        assert!(region.read_at(5, &mut buf).is_err());
        assert!(region.write_at(6, &[1, 2, 3]).is_err());
    }

    #[test]
    fn loopback_read_sees_owner_writes() -> Result<()> {
        let transport = LoopbackTransport::new();
        let region = MemoryRegion::new(64);
        transport.register_memory("10.0.0.1", 6001, region.clone())?;
        region.write_at(16, &[7, 8, 9])?;

        let qp = transport.connect("10.0.0.1", 6001)?;
        let mut buf = [0u8; 3];
        qp.read(&mut buf, 16)?;
        assert_eq!(buf, [7, 8, 9]);
        Ok(())
    }

    #[test]
    fn downed_host_fails_reads_until_restored() -> Result<()> {
        let transport = LoopbackTransport::new();
        transport.register_memory("10.0.0.2", 6001, MemoryRegion::new(16))?;
        let qp = transport.connect("10.0.0.2", 6001)?;
        let mut buf = [0u8; 4];

        transport.set_host_down("10.0.0.2", true);
        assert!(matches!(
            qp.read(&mut buf, 0),
            Err(CacheError::Transport(_))
        ));
        transport.set_host_down("10.0.0.2", false);
        qp.read(&mut buf, 0)?;
        Ok(())
    }

    #[test]
    fn connect_to_unknown_endpoint_fails() {
        let transport = LoopbackTransport::new();
        assert!(transport.connect("10.9.9.9", 6001).is_err());
    }
}
