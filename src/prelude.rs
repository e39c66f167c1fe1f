//! The transport prelude.
//!
//! The purpose of this module is to alleviate imports of common
//! functionalities.

pub use crate::config::Config;
pub use crate::rdma::cq::{CompletionEntry, CompletionError, CompletionStatus};
pub use crate::rdma::mr::{MemoryRegion, RegError, RegistrationHandle};
pub use crate::rdma::nic::Device;
pub use crate::rdma::session::{Session, SessionError, SessionState};
pub use crate::rdma::type_alias::{Rank, TensorId};
pub use crate::rdma::wr::*;
pub use crate::transport::{LoopbackFabric, TcpTransport, Transport};
