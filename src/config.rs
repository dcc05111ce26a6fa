//! Peer configuration.
//!
//! A node learns its cluster from a JSON file enumerating every host with
//! the two ports each exposes: the page-pool memory region and the metadata
//! ring. The node's own address is excluded from the peer list; block-id
//! ranges are assigned by position within the sorted host set.

use std::fs;
use std::net::UdpSocket;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CacheError, Result};
use crate::types::MAX_METADATA_BLOCKS;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    pub memory_port: u16,
    pub metadata_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub hosts: Vec<HostConfig>,
    /// This node's address. When absent it is discovered by probing an
    /// outbound route (the configured hosts double as the probe targets).
    #[serde(default)]
    pub my_ip: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|err| CacheError::Config(format!("bad peer file: {err}")))?;
        if config.hosts.is_empty() {
            return Err(CacheError::Config("peer file lists no hosts".into()));
        }
        Ok(config)
    }

    pub fn single_node(host: &str, memory_port: u16, metadata_port: u16) -> Config {
        Config {
            hosts: vec![HostConfig {
                host: host.to_string(),
                memory_port,
                metadata_port,
            }],
            my_ip: Some(host.to_string()),
        }
    }

    /// This node's address, discovering it from the routing table when the
    /// peer file does not pin one.
    pub fn local_ip(&self) -> Result<String> {
        if let Some(ip) = &self.my_ip {
            return Ok(ip.clone());
        }
        // The address a UDP socket binds when routed toward a peer is the
        // address peers will see us under.
        for host in &self.hosts {
            let socket = match UdpSocket::bind("0.0.0.0:0") {
                Ok(socket) => socket,
                Err(_) => continue,
            };
            if socket
                .connect((host.host.as_str(), host.metadata_port))
                .is_ok()
            {
                if let Ok(addr) = socket.local_addr() {
                    return Ok(addr.ip().to_string());
                }
            }
        }
        Err(CacheError::Config(
            "could not discover local address; set my_ip".into(),
        ))
    }

    /// The local host entry.
    pub fn local_host(&self) -> Result<HostConfig> {
        let ip = self.local_ip()?;
        self.hosts
            .iter()
            .find(|h| h.host == ip)
            .cloned()
            .ok_or_else(|| CacheError::Config(format!("local address {ip} not in peer file")))
    }

    /// All hosts except this node.
    pub fn peer_hosts(&self) -> Result<Vec<HostConfig>> {
        let ip = self.local_ip()?;
        Ok(self
            .hosts
            .iter()
            .filter(|h| h.host != ip)
            .cloned()
            .collect())
    }

    /// Index of this node within the sorted host set.
    pub fn node_index(&self) -> Result<usize> {
        let ip = self.local_ip()?;
        let mut sorted: Vec<&HostConfig> = self.hosts.iter().collect();
        sorted.sort_by(|a, b| a.host.cmp(&b.host));
        sorted
            .iter()
            .position(|h| h.host == ip)
            .ok_or_else(|| CacheError::Config(format!("local address {ip} not in peer file")))
    }

    /// The contiguous block-id range this node is responsible for keeping
    /// local: the metadata id space split evenly across the sorted host set.
    pub fn node_block_range(&self) -> Result<Range<u64>> {
        let index = self.node_index()? as u64;
        let nodes = self.hosts.len() as u64;
        let span = MAX_METADATA_BLOCKS as u64;
        let start = index * span / nodes;
        let end = if index + 1 == nodes {
            span
        } else {
            (index + 1) * span / nodes
        };
        info!(node = index, start, end, "config.node_range");
        Ok(start..end)
    }
}
