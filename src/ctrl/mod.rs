//! Bootstrap information consumed by the transports.

mod cluster;

pub use cluster::Cluster;
