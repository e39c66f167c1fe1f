use std::fmt;
use std::sync::Arc;

use flume::{Receiver, Sender};
use parking_lot::RwLock;

use super::{Packet, Transport, TransportError, TransportEvent};
use crate::rdma::type_alias::Rank;

/// Producer side of a rank's mailbox; `None` once that rank has closed.
type Mailbox = RwLock<Option<Sender<TransportEvent>>>;

/// In-process fabric. Every rank gets a mailbox; transmitting pushes into
/// the destination's mailbox, so per-pair order is the push order.
pub struct LoopbackFabric;

impl LoopbackFabric {
    /// Create a fabric with `world_size` ranks and return one endpoint per
    /// rank, indexed by rank.
    pub fn endpoints(world_size: usize) -> Vec<LoopbackEndpoint> {
        let (senders, inboxes): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| flume::unbounded()).unzip();
        let mailboxes: Arc<[Mailbox]> = senders
            .into_iter()
            .map(|tx| RwLock::new(Some(tx)))
            .collect::<Vec<_>>()
            .into();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LoopbackEndpoint {
                rank,
                mailboxes: mailboxes.clone(),
                inbox,
            })
            .collect()
    }
}

/// A rank's attachment to a [`LoopbackFabric`].
///
/// Packets sent to a rank whose session has not started yet wait in its
/// mailbox. Closing (or dropping) the endpoint makes the rank unreachable and
/// notifies every other rank with [`TransportEvent::PeerLost`].
pub struct LoopbackEndpoint {
    rank: Rank,
    mailboxes: Arc<[Mailbox]>,
    inbox: Receiver<TransportEvent>,
}

impl LoopbackEndpoint {
    fn is_closed(&self) -> bool {
        self.mailboxes[self.rank].read().is_none()
    }
}

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("rank", &self.rank)
            .field("world_size", &self.mailboxes.len())
            .finish()
    }
}

impl Transport for LoopbackEndpoint {
    #[inline]
    fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    fn world_size(&self) -> usize {
        self.mailboxes.len()
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn transmit(&self, dst: Rank, packet: Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mailbox = self
            .mailboxes
            .get(dst)
            .ok_or(TransportError::PeerUnreachable(dst))?
            .read();
        mailbox
            .as_ref()
            .ok_or(TransportError::PeerUnreachable(dst))?
            .send(TransportEvent::Packet(packet))
            .map_err(|_| TransportError::PeerUnreachable(dst))
    }

    fn next_event(&self) -> Option<TransportEvent> {
        self.inbox.recv().ok()
    }

    fn close(&self) {
        // Dropping the only sender lets `next_event` drain and then stop.
        if self.mailboxes[self.rank].write().take().is_none() {
            return;
        }

        for (rank, mailbox) in self.mailboxes.iter().enumerate() {
            if rank == self.rank {
                continue;
            }
            // Closed mailboxes belong to ranks that are gone already.
            if let Some(tx) = mailbox.read().as_ref() {
                let _ = tx.send(TransportEvent::PeerLost(self.rank));
            }
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
