//! The wire underneath the transfer engine.
//!
//! A [`Transport`] is one rank's attachment to a fabric. It moves tagged
//! packets to peers in per-peer FIFO order and surfaces inbound packets and
//! peer failures as [`TransportEvent`]s. Owning a transport value is what
//! entitles a [`Session`](crate::Session) to act as that rank, so there is
//! at most one session per endpoint.
//!
//! Current implementations:
//! - [`LoopbackEndpoint`] -- in-process fabric, every rank is a thread
//! - [`TcpTransport`] -- full mesh of TCP connections

mod loopback;
mod tcp;

use std::io;

use thiserror::Error;

pub use self::loopback::*;
pub use self::tcp::*;
use crate::rdma::type_alias::{Rank, TensorId};

/// A tagged message between two ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sending rank.
    pub src: Rank,

    /// Transfer tag chosen by the sender.
    pub tensor_id: TensorId,

    /// Transferred bytes.
    pub payload: Vec<u8>,
}

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A packet arrived.
    Packet(Packet),

    /// The connection to a peer is gone. Packets that peer sent before
    /// disappearing are always delivered before this event.
    PeerLost(Rank),
}

/// Transport error type.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer does not exist, has shut down, or its connection broke.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(Rank),

    /// The peer did not respond in time.
    #[error("timed out talking to peer {0}")]
    Timeout(Rank),

    /// Connection establishment failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The payload is larger than the fabric carries.
    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },

    /// Socket-level error.
    #[error("I/O error")]
    IoError(#[from] io::Error),

    /// This endpoint has been closed.
    #[error("transport is closed")]
    Closed,
}

/// One rank's attachment to a fabric.
pub trait Transport: Send + Sync {
    /// Rank of this endpoint.
    fn rank(&self) -> Rank;

    /// Number of ranks in the job.
    fn world_size(&self) -> usize;

    /// Establish connectivity with all peers. Called once before any traffic.
    fn connect(&self) -> Result<(), TransportError>;

    /// Hand a packet to the wire. Returns once the fabric has accepted it;
    /// packets to the same destination are delivered in call order.
    fn transmit(&self, dst: Rank, packet: Packet) -> Result<(), TransportError>;

    /// Block until the next inbound event. `None` once the endpoint is closed.
    fn next_event(&self) -> Option<TransportEvent>;

    /// Tear down connectivity and wake [`next_event`](Self::next_event).
    /// Idempotent.
    fn close(&self);
}
