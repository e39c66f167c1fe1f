//! Transport configuration.
//!
//! Configuration lives in the `[p2p]` table of a TOML file:
//!
//! ```toml
//! [p2p]
//! devices = ["mlx5_0", "mlx5_1"]
//! device_filters = ["^mlx5_"]
//! gpu_numa_node = 0
//! max_registered_bytes = 1073741824
//! io_timeout_ms = 10000
//! max_message_bytes = 268435456
//!
//! [p2p.cluster]
//! rank = 0
//! peers = ["10.0.0.1:13337", "10.0.0.2:13337"]
//! ```

use std::io::prelude::*;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::transport::TcpTransport;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("cannot read configuration file")]
    IoError(#[from] std::io::Error),

    /// The file is not valid TOML or does not match the expected schema.
    #[error("malformed configuration: {0}")]
    Malformed(#[from] toml::de::Error),

    /// The `[p2p]` table is missing.
    #[error("p2p configuration not found")]
    NotFound,
}

/// Peer list for the TCP fabric.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Rank of this process.
    pub rank: usize,

    /// Listening address of every rank, indexed by rank.
    pub peers: Vec<SocketAddr>,
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Static device list. When set, sysfs is not consulted.
    pub devices: Option<Vec<String>>,

    /// Directory scanned for RDMA devices.
    pub sysfs_root: PathBuf,

    /// Device name patterns (regular expressions); a device must match any.
    pub device_filters: Vec<String>,

    /// Local rank on this host. Detected from the environment if unset.
    pub local_rank: Option<usize>,

    /// NUMA node of the accelerator driven by this process.
    pub gpu_numa_node: Option<u8>,

    /// Upper bound on the total number of registered bytes.
    pub max_registered_bytes: Option<usize>,

    /// Lock registered host memory into RAM.
    pub pin_host_memory: bool,

    /// Socket read/write timeout of the TCP fabric, in milliseconds.
    pub io_timeout_ms: u64,

    /// Largest payload a single TCP message may carry, in bytes.
    pub max_message_bytes: usize,

    /// Peer list for the TCP fabric.
    pub cluster: Option<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: None,
            sysfs_root: PathBuf::from(Self::DEFAULT_SYSFS_ROOT),
            device_filters: Vec::new(),
            local_rank: None,
            gpu_numa_node: None,
            max_registered_bytes: None,
            pin_host_memory: false,
            io_timeout_ms: 30_000,
            max_message_bytes: TcpTransport::DEFAULT_MAX_MESSAGE,
            cluster: None,
        }
    }
}

impl Config {
    /// Where the kernel exposes RDMA devices.
    pub const DEFAULT_SYSFS_ROOT: &'static str = "/sys/class/infiniband";

    /// Configuration with a fixed device list, for software fabrics.
    pub fn with_devices<S: Into<String>>(devices: impl IntoIterator<Item = S>) -> Self {
        Self {
            devices: Some(devices.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Parse the `[p2p]` table of a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Root {
            p2p: Option<Config>,
        }

        let root: Root = toml::from_str(s)?;
        root.p2p.ok_or(ConfigError::NotFound)
    }

    /// Load the `[p2p]` table from a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut file = std::fs::File::open(path)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    /// Socket timeout as a `Duration`.
    #[inline]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
