//! Completion queues.

mod wc;

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;

pub use self::wc::*;

/// Completion pop error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// The session has not been initialized yet.
    #[error("session not initialized")]
    NotInitialized,

    /// The session shut down and every entry has been consumed.
    #[error("session is shutting down")]
    Shutdown,
}

/// Completion queue.
///
/// An unbounded FIFO of [`CompletionEntry`]s for one transfer direction,
/// filled through senders handed to the engine and drained by any number of
/// consumer threads. Every entry is handed to exactly one consumer.
///
/// The queue keeps one sender of its own until [`close`](Self::close); once
/// that and every engine-held sender are dropped, consumers drain what is
/// left and then fail with [`CompletionError::Shutdown`].
pub(crate) struct CompletionQueue {
    tx: Mutex<Option<Sender<CompletionEntry>>>,
    rx: Receiver<CompletionEntry>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// A producer handle, or `None` if the queue has been closed.
    pub fn sender(&self) -> Option<Sender<CompletionEntry>> {
        self.tx.lock().clone()
    }

    /// Drop the queue's own sender.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Blockingly pop the oldest entry.
    pub fn pop(&self) -> Result<CompletionEntry, CompletionError> {
        self.rx.recv().map_err(|_| CompletionError::Shutdown)
    }

    /// Non-blockingly pop the oldest entry, if any.
    pub fn try_pop(&self) -> Result<Option<CompletionEntry>, CompletionError> {
        match self.rx.try_recv() {
            Ok(entry) => Ok(Some(entry)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CompletionError::Shutdown),
        }
    }

    /// Blockingly pop the oldest entry, giving up with `Ok(None)` after `timeout`.
    pub fn pop_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<CompletionEntry>, CompletionError> {
        match self.rx.recv_timeout(timeout) {
            Ok(entry) => Ok(Some(entry)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CompletionError::Shutdown),
        }
    }
}
