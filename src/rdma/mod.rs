//! Point-to-point transfer functionalities.

pub mod cq;
pub(crate) mod engine;
pub mod mr;
pub mod nic;
pub mod session;
pub mod type_alias;
pub mod wr;
