//! RDMA device discovery.

mod affinity;
mod device;

use std::io::Error as IoError;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;

pub use self::device::*;
use crate::config::Config;
use crate::rdma::type_alias::Rank;

/// Where device names come from.
enum DeviceSource {
    /// Scan a sysfs class directory.
    Sysfs(PathBuf),

    /// A fixed list, for hosts driven by a software fabric.
    Static(Vec<String>),
}

/// RDMA device finder.
pub struct DeviceFinder {
    /// Device source.
    source: DeviceSource,

    /// Device name filters (match any).
    dev_names: Vec<Regex>,

    /// NUMA node filter (match any).
    numa_nodes: Vec<u8>,
}

impl DeviceFinder {
    /// Determine whether the current filter matches the specified device.
    ///
    /// If a NUMA filter is set but the device's NUMA node is unknown, the
    /// filter is considered unmatched.
    fn is_device_eligible(&self, name: &str, numa: Option<u8>) -> bool {
        (self.dev_names.is_empty() || self.dev_names.iter().any(|re| re.is_match(name)))
            && (self.numa_nodes.is_empty()
                || numa.is_some_and(|node| self.numa_nodes.contains(&node)))
    }
}

impl DeviceFinder {
    /// Create a finder that scans `/sys/class/infiniband` and matches any device.
    pub fn new() -> Self {
        Self {
            source: DeviceSource::Sysfs(PathBuf::from(Config::DEFAULT_SYSFS_ROOT)),
            dev_names: Vec::new(),
            numa_nodes: Vec::new(),
        }
    }

    /// Create a finder from the device section of a [`Config`].
    pub fn from_config(cfg: &Config) -> Result<Self, DeviceError> {
        let mut finder = match &cfg.devices {
            Some(names) => Self::new().static_devices(names.iter().cloned()),
            None => Self::new().sysfs_root(&cfg.sysfs_root),
        };
        for pattern in &cfg.device_filters {
            finder = finder.dev_name(pattern)?;
        }
        Ok(finder)
    }

    /// Scan the given sysfs class directory instead of the default one.
    #[inline]
    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source = DeviceSource::Sysfs(root.into());
        self
    }

    /// Use a fixed device list instead of scanning sysfs.
    /// NUMA nodes of such devices are unknown.
    #[inline]
    pub fn static_devices<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.source = DeviceSource::Static(names.into_iter().map(Into::into).collect());
        self
    }

    /// Set a device name filter.
    /// Permit only devices whose name matches *any* of the filters.
    ///
    /// Regular expressions are supported.
    #[inline]
    pub fn dev_name(mut self, pattern: impl AsRef<str>) -> Result<Self, DeviceError> {
        self.dev_names.push(Regex::new(pattern.as_ref())?);
        Ok(self)
    }

    /// Set a NUMA node filter.
    /// Permit only devices installed on *any* of the specified NUMA nodes.
    #[inline]
    pub fn numa_node(mut self, node: u8) -> Self {
        self.numa_nodes.push(node);
        self
    }

    /// Find all eligible devices, ordered by name and indexed from 0.
    pub fn probe(self) -> Result<Vec<Device>, DeviceError> {
        let mut found = match &self.source {
            DeviceSource::Sysfs(root) => scan_sysfs(root)?,
            DeviceSource::Static(names) => names.iter().map(|n| (n.clone(), None)).collect(),
        };
        found.sort();
        found.dedup_by(|a, b| a.0 == b.0);

        let devices = found
            .into_iter()
            .filter(|(name, numa)| self.is_device_eligible(name, *numa))
            .enumerate()
            .map(|(index, (name, numa))| Device::new(index, name, numa))
            .collect::<Vec<_>>();

        if devices.is_empty() {
            return Err(DeviceError::NoDeviceAvailable);
        }
        Ok(devices)
    }
}

impl Default for DeviceFinder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Device discovery error type.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Failed to read the device directory.
    #[error("I/O error while scanning devices")]
    IoError(#[from] IoError),

    /// A device name filter is not a valid regular expression.
    #[error("invalid device filter pattern")]
    BadFilter(#[from] regex::Error),

    /// No eligible RDMA device found.
    #[error("no usable RDMA device found")]
    NoDeviceAvailable,
}

/// The devices visible to this process and the one it uses.
///
/// Read-only once built, so it can be shared by any number of readers.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    devices: Vec<Device>,
    local: usize,
    local_gpu: usize,
}

impl DeviceDirectory {
    /// Discover devices and select the local one for the process at `rank`.
    pub fn discover(cfg: &Config, rank: Rank) -> Result<Self, DeviceError> {
        let devices = DeviceFinder::from_config(cfg)?.probe()?;
        let local_gpu = affinity::local_rank(cfg.local_rank, rank);
        let local = affinity::select(&devices, local_gpu, cfg.gpu_numa_node)
            .ok_or(DeviceError::NoDeviceAvailable)?;

        log::info!(
            "rrp2p: rank {} (local {}) uses device {} out of {:?}",
            rank,
            local_gpu,
            devices[local],
            devices.iter().map(Device::name).collect::<Vec<_>>()
        );
        Ok(Self {
            devices,
            local,
            local_gpu,
        })
    }

    /// All discovered devices, in a deterministic order.
    #[inline]
    pub fn list(&self) -> &[Device] {
        &self.devices
    }

    /// The device selected for this process.
    #[inline]
    pub fn local_device(&self) -> &Device {
        &self.devices[self.local]
    }

    /// Index of the accelerator driven by this process (its node-local rank).
    #[inline]
    pub fn local_gpu(&self) -> usize {
        self.local_gpu
    }
}
