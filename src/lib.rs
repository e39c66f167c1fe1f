//! An ordered point-to-point transport for moving tensors between the ranks
//! of a distributed job, shaped after RDMA verbs.
//!
//! A [`Session`] is one rank's attachment to a fabric. Once initialized, it
//! discovers the RDMA devices of the host and picks the one closest to this
//! process's accelerator, registers caller-owned memory
//! ([`Session::register_memory`]), and issues asynchronous tagged sends and
//! receives ([`Session::send`], [`Session::recv`]). Every admitted transfer
//! produces exactly one [`CompletionEntry`] on the send or receive
//! completion queue, which callers drain with the blocking
//! [`Session::pop_send_completion`] / [`Session::pop_recv_completion`].
//!
//! Transfers with the same (sender, receiver, tag) triple complete in issue
//! order. Transport failures after admission are reported through
//! [`CompletionEntry::error_code`]; there is no internal retry.
//!
//! The wire is pluggable through the [`transport::Transport`] trait. Two
//! fabrics are included: an in-process [`LoopbackFabric`] for ranks that
//! are threads of one process, and [`TcpTransport`], a full TCP mesh
//! bootstrapped from a [`ctrl::Cluster`].
//!
//! # Example
//!
//! ```rust
//! use rrp2p::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let mut eps = LoopbackFabric::endpoints(2);
//!     let s1 = Session::new(Config::with_devices(["mlx5_0"]), eps.pop().unwrap());
//!     let s0 = Session::new(Config::with_devices(["mlx5_0"]), eps.pop().unwrap());
//!     s0.initialize()?;
//!     s1.initialize()?;
//!
//!     let mut src = vec![1u8; 4096];
//!     let mut dst = vec![0u8; 4096];
//!     let hs = unsafe { s0.register_memory(src.as_mut_ptr(), src.len())? };
//!     let hd = unsafe { s1.register_memory(dst.as_mut_ptr(), dst.len())? };
//!
//!     let region = MemoryRegion::from_slice(&mut src);
//!     s0.send(1, region, hs, 4096, 7, TransferContext(1), TransferFlags::EMPTY)?;
//!     let region = MemoryRegion::from_slice(&mut dst);
//!     s1.recv(0, region, hd, 4096, 7, TransferContext(2), TransferFlags::EMPTY)?;
//!
//!     assert!(s0.pop_send_completion()?.is_success());
//!     assert!(s1.pop_recv_completion()?.is_success());
//!     assert_eq!(dst, src);
//!     Ok(())
//! }
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

mod rdma;
pub use rdma::session::{Session, SessionError, SessionState};
pub use rdma::type_alias::*;
pub use rdma::{cq::*, mr::*, nic::*, wr::*};

/// Bootstrap information for multi-host fabrics.
pub mod ctrl;

/// Configuration.
pub mod config;
pub use config::{Config, ConfigError};

pub mod transport;
pub use transport::{LoopbackEndpoint, LoopbackFabric, TcpTransport};

pub mod prelude;

mod utils;
