use std::net::SocketAddr;
use std::path::Path;

use crate::config::{ClusterConfig, Config, ConfigError};

/// Cluster information: the rank of this process and the listening address
/// of every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    peers: Vec<SocketAddr>,
    rank: usize,
}

impl Cluster {
    /// Create cluster information.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is out of bounds of `peers`.
    pub fn new(peers: Vec<SocketAddr>, rank: usize) -> Self {
        assert!(
            rank < peers.len(),
            "rank {} is out of bounds (size = {})",
            rank,
            peers.len()
        );
        Cluster { peers, rank }
    }

    /// Build from the `[p2p.cluster]` table.
    pub fn from_config(cfg: &ClusterConfig) -> Option<Self> {
        (cfg.rank < cfg.peers.len()).then(|| Self::new(cfg.peers.clone(), cfg.rank))
    }

    /// Load the `[p2p.cluster]` table from a TOML file.
    pub fn load_toml(config_file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let cfg = Config::load_toml(config_file)?;
        cfg.cluster
            .as_ref()
            .and_then(Self::from_config)
            .ok_or(ConfigError::NotFound)
    }

    #[inline]
    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn get(&self, rank: usize) -> Option<SocketAddr> {
        self.peers.get(rank).cloned()
    }

    /// Listening address of this process.
    #[inline]
    pub fn myself(&self) -> SocketAddr {
        self.peers[self.rank]
    }
}
