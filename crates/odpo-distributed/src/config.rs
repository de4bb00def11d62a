//! Static cluster configuration.

use crate::error::{DistributedError, DistributedResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Worker addresses and connection limits for one ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Every worker's listen address, indexed by rank. Identical on all workers.
    pub nodes: Vec<SocketAddr>,

    /// This worker's index into `nodes`.
    pub rank: usize,

    /// How long to wait for the predecessor to connect.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Attempts at reaching the successor before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    50
}

impl DistributedConfig {
    /// Ring over `nodes` as seen from `rank`, with default limits.
    pub fn new(nodes: Vec<SocketAddr>, rank: usize) -> Self {
        Self {
            nodes,
            rank,
            connection_timeout_ms: default_connection_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    /// Reject empty rings, out-of-range ranks and repeated addresses.
    pub fn validate(&self) -> DistributedResult<()> {
        let fail = |msg: String| Err(DistributedError::Config(msg));
        if self.nodes.is_empty() {
            return fail("at least one node address is required".into());
        }
        if self.rank >= self.nodes.len() {
            return fail(format!(
                "rank {} does not exist among {} nodes",
                self.rank,
                self.nodes.len()
            ));
        }
        let mut seen = HashSet::with_capacity(self.nodes.len());
        if let Some(addr) = self.nodes.iter().find(|addr| !seen.insert(*addr)) {
            return fail(format!("{addr} appears more than once in the node list"));
        }
        Ok(())
    }

    /// Ring size.
    pub fn world_size(&self) -> usize {
        self.nodes.len()
    }

    /// Where this worker accepts its predecessor.
    pub fn local_addr(&self) -> SocketAddr {
        self.nodes[self.rank]
    }

    /// Rank this worker sends to.
    pub fn next_rank(&self) -> usize {
        (self.rank + 1) % self.world_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: u16) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("127.0.0.1:{}", 52416 + i).parse().unwrap())
            .collect()
    }

    #[test]
    fn test_validate() {
        assert!(DistributedConfig::new(addrs(3), 2).validate().is_ok());
        assert!(DistributedConfig::new(addrs(3), 3).validate().is_err());
        assert!(DistributedConfig::new(Vec::new(), 0).validate().is_err());

        let mut dup = addrs(2);
        dup.push(dup[0]);
        assert!(DistributedConfig::new(dup, 0).validate().is_err());
    }

    #[test]
    fn test_ring_neighbours() {
        let config = DistributedConfig::new(addrs(3), 2);
        assert_eq!(config.world_size(), 3);
        assert_eq!(config.next_rank(), 0);
        assert_eq!(config.local_addr(), "127.0.0.1:52418".parse().unwrap());
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{"nodes":["127.0.0.1:1000"],"rank":0}"#;
        let config: DistributedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.connection_timeout_ms, 30000);
        assert_eq!(config.max_retries, 50);
    }
}
