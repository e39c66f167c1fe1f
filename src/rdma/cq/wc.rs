use std::fmt;

use thiserror::Error;

use crate::rdma::type_alias::{Rank, TensorId};
use crate::rdma::wr::TransferContext;

/// Outcome of a transfer, carried as the `error_code` of its completion entry.
///
/// Zero means success. Failures detected after a request was admitted are
/// only ever reported this way, never by `send`/`recv` themselves, and are
/// never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum CompletionStatus {
    /// **Success:** the bytes were handed to the wire (send) or placed into
    /// the posted buffer (recv). The buffer may be reused.
    #[error("success")]
    Success = 0,

    /// **Peer Unreachable:** the peer has shut down or its connection broke
    /// before the transfer could be carried out.
    #[error("peer unreachable")]
    PeerUnreachable = 1,

    /// **Timeout:** the peer did not accept the data in time.
    #[error("transfer timed out")]
    Timeout = 2,

    /// **Length Mismatch:** the matched incoming message was larger than the
    /// posted receive. The receive buffer is left untouched.
    #[error("incoming message larger than the posted receive")]
    LengthMismatch = 3,

    /// **Cancelled:** the session shut down while the request was outstanding.
    #[error("cancelled by session shutdown")]
    Cancelled = 4,
}

impl CompletionStatus {
    /// The integer error code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode an error code. Returns `None` for unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::PeerUnreachable),
            2 => Some(Self::Timeout),
            3 => Some(Self::LengthMismatch),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Completion entry, produced exactly once for every admitted send or recv.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    /// The caller's token from the request.
    pub context: TransferContext,

    /// Destination rank of a send, source rank of a recv.
    pub peer_rank: Rank,

    /// Tag of the request.
    pub tensor_id: TensorId,

    /// [`CompletionStatus`] code; zero on success.
    pub error_code: i32,

    /// Number of bytes sent or received.
    pub bytes: usize,
}

impl CompletionEntry {
    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> Option<CompletionStatus> {
        CompletionStatus::from_code(self.error_code)
    }

    /// Whether the transfer succeeded.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// Get the completion status as a `Result`.
    ///
    /// - On success, return the number of bytes transferred.
    /// - Otherwise, return the error code.
    #[inline]
    pub fn ok(&self) -> Result<usize, i32> {
        match self.error_code {
            0 => Ok(self.bytes),
            code => Err(code),
        }
    }
}

impl fmt::Debug for CompletionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEntry")
            .field("context", &format_args!("{}", self.context))
            .field("peer_rank", &self.peer_rank)
            .field("tensor_id", &self.tensor_id)
            .field("error_code", &self.error_code)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        for status in [
            CompletionStatus::Success,
            CompletionStatus::PeerUnreachable,
            CompletionStatus::Timeout,
            CompletionStatus::LengthMismatch,
            CompletionStatus::Cancelled,
        ] {
            assert_eq!(CompletionStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(CompletionStatus::Success.code(), 0);
        assert_eq!(CompletionStatus::from_code(-7), None);
    }

    #[test]
    fn test_entry_ok() {
        let mut e = CompletionEntry {
            context: TransferContext(0x4567),
            peer_rank: 0,
            tensor_id: 9876,
            error_code: 0,
            bytes: 1024,
        };
        assert_eq!(e.ok(), Ok(1024));
        e.error_code = CompletionStatus::Cancelled.code();
        assert!(!e.is_success());
        assert_eq!(e.ok(), Err(4));
        assert_eq!(e.status(), Some(CompletionStatus::Cancelled));
    }
}
