//! Choosing the local device of a process.

use super::Device;
use crate::rdma::type_alias::Rank;

/// Environment variables launchers use to publish the node-local rank.
const LOCAL_RANK_VARS: [&str; 4] = [
    "LOCAL_RANK",
    "OMPI_COMM_WORLD_LOCAL_RANK",
    "MPI_LOCALRANKID",
    "SLURM_LOCALID",
];

fn env_local_rank() -> Option<usize> {
    LOCAL_RANK_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok()?.trim().parse().ok())
}

/// Node-local rank of this process: the configured value, else what the
/// launcher exported, else the global rank.
pub(crate) fn local_rank(configured: Option<usize>, rank: Rank) -> usize {
    configured.or_else(env_local_rank).unwrap_or(rank)
}

/// Pick the index of the device serving the `local_rank`-th accelerator.
///
/// Devices on the accelerator's NUMA node are preferred when any exist;
/// local ranks are spread over the candidates round-robin.
pub(crate) fn select(devices: &[Device], local_rank: usize, gpu_numa: Option<u8>) -> Option<usize> {
    if devices.is_empty() {
        return None;
    }

    let near = gpu_numa
        .map(|node| {
            devices
                .iter()
                .filter(|dev| dev.numa_node() == Some(node))
                .map(Device::index)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if near.is_empty() {
        Some(local_rank % devices.len())
    } else {
        Some(near[local_rank % near.len()])
    }
}
