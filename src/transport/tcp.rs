use std::io::{self, prelude::*};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{Packet, Transport, TransportError, TransportEvent};
use crate::ctrl::Cluster;
use crate::rdma::type_alias::{Rank, TensorId};

/// Largest hello accepted during mesh setup.
const MAX_HELLO_LEN: usize = 4096;

/// Bytes of a data frame in front of the payload.
const FRAME_HEADER_LEN: usize = std::mem::size_of::<TensorId>();

/// Exchanged once on every new connection.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: Rank,
    world_size: usize,
}

fn stream_write(stream: &mut &TcpStream, buf: &[u8]) -> io::Result<()> {
    stream.write_all(&(buf.len() as u64).to_le_bytes())?;
    stream.write_all(buf)
}

/// Read one length-prefixed message of at most `max` bytes.
fn stream_read(stream: &mut &TcpStream, max: usize) -> io::Result<Vec<u8>> {
    let mut len = [0; 8];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > max as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {len} bytes exceeds the {max}-byte limit"),
        ));
    }

    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Data frame: `tensor_id` (little-endian `i32`) followed by the payload.
fn write_frame(stream: &mut &TcpStream, tensor_id: TensorId, payload: &[u8]) -> io::Result<()> {
    let len = (FRAME_HEADER_LEN + payload.len()) as u64;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&tensor_id.to_le_bytes())?;
    stream.write_all(payload)
}

fn read_frame(stream: &mut &TcpStream, max_payload: usize) -> io::Result<(TensorId, Vec<u8>)> {
    let mut body = stream_read(stream, max_payload.saturating_add(FRAME_HEADER_LEN))?;
    if body.len() < FRAME_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too short ({} bytes)", body.len()),
        ));
    }
    let payload = body.split_off(FRAME_HEADER_LEN);
    let tensor_id = TensorId::from_le_bytes([body[0], body[1], body[2], body[3]]);
    Ok((tensor_id, payload))
}

fn connect_until_success(addr: SocketAddr, deadline: Instant) -> Option<TcpStream> {
    loop {
        if let Ok(stream) = TcpStream::connect(addr) {
            break Some(stream);
        }
        if Instant::now() >= deadline {
            break None;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Writer half of a peer connection.
struct Link {
    stream: Mutex<TcpStream>,
}

/// Full mesh of TCP connections between all ranks of a [`Cluster`].
///
/// The side with the smaller rank connects, the other side accepts; both
/// sides then exchange a JSON hello carrying their rank. Connections that
/// fail the handshake are dropped without disturbing the rest of the mesh.
/// Each connection has a dedicated reader thread feeding a shared inbox, and
/// all writes to a peer go through a single stream, so per-pair order is
/// preserved.
pub struct TcpTransport {
    cluster: Cluster,
    io_timeout: Duration,
    max_message: usize,
    links: RwLock<Vec<Option<Arc<Link>>>>,
    inbox_tx: Mutex<Option<Sender<TransportEvent>>>,
    inbox: Receiver<TransportEvent>,
    closed: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Payload limit unless configured otherwise.
    pub const DEFAULT_MAX_MESSAGE: usize = 1 << 30;

    /// Create an unconnected transport. `io_timeout` bounds mesh setup and
    /// every write.
    pub fn new(cluster: Cluster, io_timeout: Duration) -> Self {
        let size = cluster.size();
        let (inbox_tx, inbox) = flume::unbounded();
        Self {
            cluster,
            io_timeout,
            max_message: Self::DEFAULT_MAX_MESSAGE,
            links: RwLock::new((0..size).map(|_| None).collect()),
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox,
            closed: Arc::new(AtomicBool::new(false)),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Limit the payload of a single message, in both directions. A peer
    /// announcing a larger frame is treated as broken.
    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }

    fn hello(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(&Hello {
            rank: self.cluster.rank(),
            world_size: self.cluster.size(),
        })
        .map_err(|e| TransportError::Handshake(format!("cannot encode hello: {e}")))
    }

    fn read_hello(&self, mut stream: &TcpStream) -> Result<Hello, TransportError> {
        let buf = stream_read(&mut stream, MAX_HELLO_LEN)?;
        let hello = serde_json::from_slice::<Hello>(&buf).map_err(|e| {
            TransportError::Handshake(format!(
                "cannot decode hello (from: {}): {e}",
                String::from_utf8_lossy(&buf)
            ))
        })?;
        if hello.world_size != self.cluster.size() || hello.rank >= self.cluster.size() {
            return Err(TransportError::Handshake(format!(
                "peer claims rank {} of {}, local world size is {}",
                hello.rank,
                hello.world_size,
                self.cluster.size()
            )));
        }
        Ok(hello)
    }

    /// Handshake on a connection accepted from a lower rank. `links` holds
    /// the peers connected so far.
    fn greet(
        &self,
        stream: &TcpStream,
        hello: &[u8],
        links: &[Option<TcpStream>],
    ) -> Result<Rank, TransportError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        let remote = self.read_hello(stream)?;
        if remote.rank >= self.cluster.rank() || links[remote.rank].is_some() {
            return Err(TransportError::Handshake(format!(
                "unexpected connection from rank {}",
                remote.rank
            )));
        }
        let mut s = stream;
        stream_write(&mut s, hello)?;
        Ok(remote.rank)
    }

    fn start_reader(&self, peer: Rank, stream: &TcpStream) -> Result<(), TransportError> {
        let stream = stream.try_clone()?;
        let inbox = self.inbox_tx.lock().clone().ok_or(TransportError::Closed)?;
        let closed = self.closed.clone();
        let max_message = self.max_message;
        let handle = thread::Builder::new()
            .name(format!("rrp2p-tcp-rx-{peer}"))
            .spawn(move || reader_loop(peer, stream, max_message, inbox, closed))?;
        self.readers.lock().push(handle);
        Ok(())
    }
}

fn reader_loop(
    peer: Rank,
    stream: TcpStream,
    max_message: usize,
    inbox: Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut stream = &stream;
    loop {
        let event = match read_frame(&mut stream, max_message) {
            Ok((tensor_id, payload)) => TransportEvent::Packet(Packet {
                src: peer,
                tensor_id,
                payload,
            }),
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof && !closed.load(Ordering::Acquire) {
                    log::error!("rrp2p: connection to peer {} broke: {}", peer, e);
                } else {
                    log::debug!("rrp2p: peer {} disconnected", peer);
                }
                // Let the peer see the break as well.
                let _ = stream.shutdown(Shutdown::Both);
                TransportEvent::PeerLost(peer)
            }
        };

        // Nothing is reported once the transport is closed locally.
        let lost = matches!(event, TransportEvent::PeerLost(_));
        if closed.load(Ordering::Acquire) || inbox.send(event).is_err() || lost {
            break;
        }
    }
}

impl Transport for TcpTransport {
    #[inline]
    fn rank(&self) -> Rank {
        self.cluster.rank()
    }

    #[inline]
    fn world_size(&self) -> usize {
        self.cluster.size()
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let me = self.cluster.rank();
        let deadline = Instant::now() + self.io_timeout;
        let hello = self.hello()?;
        let mut links: Vec<Option<TcpStream>> = (0..self.cluster.size()).map(|_| None).collect();

        let listener = TcpListener::bind(self.cluster.myself())?;

        // Connect to every rank above me.
        for peer in (me + 1)..self.cluster.size() {
            let addr = self.cluster.peers()[peer];
            let stream =
                connect_until_success(addr, deadline).ok_or(TransportError::Timeout(peer))?;
            stream.set_read_timeout(Some(self.io_timeout))?;

            let mut s = &stream;
            stream_write(&mut s, &hello)?;
            let remote = self.read_hello(&stream)?;
            if remote.rank != peer {
                return Err(TransportError::Handshake(format!(
                    "expected rank {} at {}, found rank {}",
                    peer, addr, remote.rank
                )));
            }
            links[peer] = Some(stream);
        }

        // Accept every rank below me.
        listener.set_nonblocking(true)?;
        let mut pending = me;
        while pending > 0 {
            match listener.accept() {
                Ok((stream, from)) => match self.greet(&stream, &hello, &links) {
                    Ok(peer) => {
                        links[peer] = Some(stream);
                        pending -= 1;
                    }
                    Err(e) => {
                        log::warn!("rrp2p: rank {} dropped connection from {}: {}", me, from, e)
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        let missing = (0..me).find(|&r| links[r].is_none()).unwrap_or(0);
                        return Err(TransportError::Timeout(missing));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut table = self.links.write();
        for (peer, stream) in links.into_iter().enumerate() {
            let Some(stream) = stream else {
                continue;
            };
            stream.set_read_timeout(None)?;
            stream.set_write_timeout(Some(self.io_timeout))?;
            stream.set_nodelay(true)?;
            self.start_reader(peer, &stream)?;
            table[peer] = Some(Arc::new(Link {
                stream: Mutex::new(stream),
            }));
        }
        log::debug!(
            "rrp2p: rank {} connected to {} peers",
            me,
            self.cluster.size() - 1
        );
        Ok(())
    }

    fn transmit(&self, dst: Rank, packet: Packet) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if packet.payload.len() > self.max_message {
            return Err(TransportError::Oversized {
                len: packet.payload.len(),
                max: self.max_message,
            });
        }
        let link = self
            .links
            .read()
            .get(dst)
            .cloned()
            .flatten()
            .ok_or(TransportError::PeerUnreachable(dst))?;

        let stream = link.stream.lock();
        let mut s = &*stream;
        write_frame(&mut s, packet.tensor_id, &packet.payload).map_err(|e| {
            log::warn!("rrp2p: write to peer {} failed: {}", dst, e);
            if is_timeout(&e) {
                TransportError::Timeout(dst)
            } else {
                TransportError::PeerUnreachable(dst)
            }
        })
    }

    fn next_event(&self) -> Option<TransportEvent> {
        self.inbox.recv().ok()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Readers woken by the shutdown below see `closed` and exit without
        // reporting; once they and this sender are gone the inbox ends.
        self.inbox_tx.lock().take();
        for link in self.links.write().drain(..).flatten() {
            let _ = link.stream.lock().shutdown(Shutdown::Both);
        }

        let readers = std::mem::take(&mut *self.readers.lock());
        for reader in readers {
            let _ = reader.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
