use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// An RDMA-capable network device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    index: usize,
    name: String,
    numa_node: Option<u8>,
}

impl Device {
    pub(crate) fn new(index: usize, name: String, numa_node: Option<u8>) -> Self {
        Self {
            index,
            name,
            numa_node,
        }
    }

    /// Position of this device in the directory's ordered device list.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Device name as shown by `ibv_devinfo` (e.g., `mlx5_0`).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// NUMA node the device is attached to, if known.
    #[inline]
    pub fn numa_node(&self) -> Option<u8> {
        self.numa_node
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Read the NUMA node of a device from its sysfs directory.
///
/// The kernel reports `-1` for devices without NUMA affinity.
fn read_numa_node(dev_dir: &Path) -> Option<u8> {
    let buf = fs::read_to_string(dev_dir.join("device/numa_node")).ok()?;
    buf.trim().parse::<i32>().ok().and_then(|n| u8::try_from(n).ok())
}

/// List the devices under a sysfs class directory such as
/// `/sys/class/infiniband`, as `(name, numa_node)` pairs sorted by name.
///
/// A missing directory means no devices.
pub(crate) fn scan_sysfs(root: &Path) -> io::Result<Vec<(String, Option<u8>)>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            log::warn!("rrp2p: skipping device with non-UTF-8 name {:?}", entry.file_name());
            continue;
        };
        devices.push((name, read_numa_node(&entry.path())));
    }
    devices.sort();
    Ok(devices)
}
