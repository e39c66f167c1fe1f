//! Asynchronous transfer engine.
//!
//! Two threads per session:
//! - the *progress* thread owns all matching state and handles submissions,
//!   inbound packets and peer failures strictly in the order they were
//!   queued;
//! - the *pump* thread moves events from the transport into that queue.
//!
//! Because a single thread transmits every send and the transport keeps
//! per-peer order, sends on a (sender, receiver) pair leave in issue order.
//! Receives are matched per `(source, tensor_id)` first-issued-first-matched,
//! and packets arriving before a matching receive wait in an unexpected
//! queue with the same key, so every tag pair completes in issue order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};

use super::cq::{CompletionEntry, CompletionStatus};
use super::mr::{RegistrationHandle, RegistrationManager};
use super::type_alias::{Rank, TensorId};
use super::wr::{Direction, TransferRequest};
use crate::transport::{Packet, Transport, TransportError, TransportEvent};

/// Input of the progress thread.
enum Event {
    Submit(TransferRequest),
    Wire(TransportEvent),

    /// Stop after everything queued before this event.
    Drain,
}

type MatchKey = (Rank, TensorId);

/// Matching state, owned by the progress thread.
struct Progress {
    rank: Rank,
    transport: Arc<dyn Transport>,
    registry: Arc<RegistrationManager>,
    send_cq: Sender<CompletionEntry>,
    recv_cq: Sender<CompletionEntry>,
    outstanding: Arc<AtomicUsize>,

    /// Posted receives waiting for data.
    posted: HashMap<MatchKey, VecDeque<TransferRequest>>,

    /// Packets that arrived before a matching receive.
    unexpected: HashMap<MatchKey, VecDeque<Vec<u8>>>,

    /// Peers whose connection is gone.
    lost: HashSet<Rank>,
}

impl Progress {
    fn run(mut self, events: Receiver<Event>) {
        while let Ok(event) = events.recv() {
            match event {
                Event::Submit(req) => match req.direction {
                    Direction::Send => self.send(req),
                    Direction::Recv => self.post_recv(req),
                },
                Event::Wire(TransportEvent::Packet(packet)) => self.on_packet(packet),
                Event::Wire(TransportEvent::PeerLost(peer)) => self.on_peer_lost(peer),
                Event::Drain => break,
            }
        }
        // Later submissions and inbound traffic fail to send from here on.
        drop(events);
        self.cancel_all();

        let dropped = self.unexpected.values().map(VecDeque::len).sum::<usize>();
        if dropped > 0 {
            log::warn!(
                "rrp2p: rank {} discarded {} unmatched inbound message(s)",
                self.rank,
                dropped
            );
        }
    }

    fn send(&mut self, req: TransferRequest) {
        // SAFETY: the registration covering `req.region` is held in flight
        // until `complete` runs, and the registrant guarantees the memory
        // stays valid while registered.
        let payload =
            unsafe { std::slice::from_raw_parts(req.region.addr() as *const u8, req.length) }
                .to_vec();
        let packet = Packet {
            src: self.rank,
            tensor_id: req.tensor_id,
            payload,
        };

        let status = match self.transport.transmit(req.peer, packet) {
            Ok(()) => CompletionStatus::Success,
            Err(TransportError::Timeout(_)) => CompletionStatus::Timeout,
            Err(e @ TransportError::Oversized { .. }) => {
                log::warn!("rrp2p: send of tensor {} failed: {}", req.tensor_id, e);
                CompletionStatus::LengthMismatch
            }
            Err(e) => {
                log::warn!(
                    "rrp2p: send of tensor {} to rank {} failed: {}",
                    req.tensor_id,
                    req.peer,
                    e
                );
                CompletionStatus::PeerUnreachable
            }
        };
        let bytes = if status == CompletionStatus::Success {
            req.length
        } else {
            0
        };
        self.complete(req, status, bytes);
    }

    fn post_recv(&mut self, req: TransferRequest) {
        let key = (req.peer, req.tensor_id);
        if let Some(payload) = pop_keyed(&mut self.unexpected, &key) {
            self.deliver(req, payload);
        } else if self.lost.contains(&req.peer) {
            self.complete(req, CompletionStatus::PeerUnreachable, 0);
        } else {
            self.posted.entry(key).or_default().push_back(req);
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        let key = (packet.src, packet.tensor_id);
        match pop_keyed(&mut self.posted, &key) {
            Some(req) => self.deliver(req, packet.payload),
            None => self
                .unexpected
                .entry(key)
                .or_default()
                .push_back(packet.payload),
        }
    }

    fn on_peer_lost(&mut self, peer: Rank) {
        log::warn!("rrp2p: rank {} lost peer {}", self.rank, peer);
        self.lost.insert(peer);

        let mut keys = self
            .posted
            .keys()
            .filter(|(src, _)| *src == peer)
            .copied()
            .collect::<Vec<_>>();
        keys.sort_unstable();
        for key in keys {
            for req in self.posted.remove(&key).unwrap_or_default() {
                self.complete(req, CompletionStatus::PeerUnreachable, 0);
            }
        }
    }

    /// Place a matched payload into a posted receive buffer.
    fn deliver(&mut self, req: TransferRequest, payload: Vec<u8>) {
        if payload.len() > req.length {
            log::warn!(
                "rrp2p: tensor {} from rank {} carries {} bytes, receive posted {}",
                req.tensor_id,
                req.peer,
                payload.len(),
                req.length
            );
            self.complete(req, CompletionStatus::LengthMismatch, 0);
            return;
        }

        // SAFETY: `payload.len() <= req.length <= req.region.len()`, the
        // region is registered and held in flight, and the payload is a
        // separate allocation.
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), req.region.addr(), payload.len()) };
        let bytes = payload.len();
        self.complete(req, CompletionStatus::Success, bytes);
    }

    /// Fail every posted receive. Runs once, when the engine drains.
    fn cancel_all(&mut self) {
        let mut keys = self.posted.keys().copied().collect::<Vec<_>>();
        keys.sort_unstable();
        for key in keys {
            for req in self.posted.remove(&key).unwrap_or_default() {
                self.complete(req, CompletionStatus::Cancelled, 0);
            }
        }
    }

    fn complete(&self, req: TransferRequest, status: CompletionStatus, bytes: usize) {
        self.registry.release(req.handle);

        let entry = CompletionEntry {
            context: req.context,
            peer_rank: req.peer,
            tensor_id: req.tensor_id,
            error_code: status.code(),
            bytes,
        };
        log::debug!(
            "rrp2p: {} {:?} completed in {:?}",
            req.direction,
            entry,
            req.issued.elapsed()
        );

        let cq = match req.direction {
            Direction::Send => &self.send_cq,
            Direction::Recv => &self.recv_cq,
        };
        if let Err(flume::SendError(entry)) = cq.send(entry) {
            log::error!(
                "rrp2p: {} completion queue is gone, dropping {:?}",
                req.direction,
                entry
            );
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Remove the oldest item queued under `key`, dropping the queue once empty.
fn pop_keyed<T>(map: &mut HashMap<MatchKey, VecDeque<T>>, key: &MatchKey) -> Option<T> {
    let queue = map.get_mut(key)?;
    let item = queue.pop_front();
    if queue.is_empty() {
        map.remove(key);
    }
    item
}

/// Handle to the engine threads of a session.
pub(crate) struct Engine {
    events: Sender<Event>,
    outstanding: Arc<AtomicUsize>,
    progress: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the progress and pump threads. Completions go to `send_cq` and
    /// `recv_cq`; both senders are dropped when the engine drains.
    pub fn start(
        transport: Arc<dyn Transport>,
        registry: Arc<RegistrationManager>,
        send_cq: Sender<CompletionEntry>,
        recv_cq: Sender<CompletionEntry>,
    ) -> io::Result<Self> {
        let rank = transport.rank();
        let (events, inbound) = flume::unbounded();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let progress = Progress {
            rank,
            transport: transport.clone(),
            registry,
            send_cq,
            recv_cq,
            outstanding: outstanding.clone(),
            posted: HashMap::new(),
            unexpected: HashMap::new(),
            lost: HashSet::new(),
        };
        let progress = thread::Builder::new()
            .name(format!("rrp2p-progress-{rank}"))
            .spawn(move || progress.run(inbound))?;

        let pump = {
            let events = events.clone();
            thread::Builder::new()
                .name(format!("rrp2p-pump-{rank}"))
                .spawn(move || {
                    while let Some(event) = transport.next_event() {
                        // Once the engine has drained, inbound traffic is dropped.
                        let _ = events.send(Event::Wire(event));
                    }
                })
        };
        let pump = match pump {
            Ok(pump) => pump,
            Err(e) => {
                let _ = events.send(Event::Drain);
                let _ = progress.join();
                return Err(e);
            }
        };

        Ok(Self {
            events,
            outstanding,
            progress: Some(progress),
            pump: Some(pump),
        })
    }

    /// Queue an admitted request. If the engine has stopped, the request is
    /// dropped and its registration handle is handed back for release.
    pub fn submit(&self, req: TransferRequest) -> Result<(), RegistrationHandle> {
        let handle = req.handle;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.events.send(Event::Submit(req)).map_err(|_| {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            handle
        })
    }

    /// Admitted requests without a completion entry yet.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Finish everything submitted so far, cancel unmatched receives and stop
    /// the progress thread. Every admitted request has a completion entry
    /// when this returns.
    pub fn drain(&mut self) {
        let _ = self.events.send(Event::Drain);
        if let Some(progress) = self.progress.take() {
            if progress.join().is_err() {
                log::error!("rrp2p: progress thread panicked");
            }
        }
    }

    /// Wait for the pump thread. The transport must be closed first.
    pub fn join_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}
