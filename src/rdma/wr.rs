//! Transfer requests.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;

use super::mr::{MemoryRegion, RegistrationHandle};
use super::session::SessionError;
use super::type_alias::{Rank, TensorId};

/// Opaque caller token carried from a request to its completion entry.
///
/// The library never interprets or dereferences it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TransferContext(pub u64);

impl From<u64> for TransferContext {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<TransferContext> for u64 {
    #[inline]
    fn from(ctx: TransferContext) -> Self {
        ctx.0
    }
}

impl fmt::Display for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-request flags.
///
/// No flag is defined yet; every bit is reserved and requests carrying
/// reserved bits are rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct TransferFlags(u32);

impl TransferFlags {
    pub const EMPTY: Self = Self(0);

    /// Bits with a defined meaning.
    const KNOWN: u32 = 0;

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Bits set in `self` that have no defined meaning.
    #[inline]
    pub const fn reserved_bits(self) -> u32 {
        self.0 & !Self::KNOWN
    }
}

impl BitOr for TransferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Which way a transfer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        })
    }
}

/// An admitted transfer, owned by the engine until its completion entry is
/// produced.
#[derive(Debug)]
pub(crate) struct TransferRequest {
    pub direction: Direction,
    pub peer: Rank,
    pub region: MemoryRegion,
    pub handle: RegistrationHandle,
    pub length: usize,
    pub tensor_id: TensorId,
    pub context: TransferContext,
    pub issued: quanta::Instant,
}

/// Synchronous send/recv rejection. A rejected call enqueues nothing and
/// produces no completion entry.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer is this process or outside the world.
    #[error("invalid peer rank {rank} (world size {world_size})")]
    InvalidRank { rank: Rank, world_size: usize },

    /// The handle is unknown, deregistered, or does not cover the region.
    #[error("invalid registration handle")]
    InvalidHandle,

    /// The requested length is larger than the region.
    #[error("length {length} exceeds region of {region} bytes")]
    LengthExceedsRegion { length: usize, region: usize },

    /// Reserved flag bits were set.
    #[error("reserved flag bits set: {0:#x}")]
    ReservedFlags(u32),

    /// The session is not in a state that accepts transfers.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Error of [`Session::send`](crate::Session::send).
pub type SendError = TransferError;

/// Error of [`Session::recv`](crate::Session::recv).
pub type RecvError = TransferError;
