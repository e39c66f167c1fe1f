//! Transport session.

use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

use super::cq::{CompletionEntry, CompletionError, CompletionQueue};
use super::engine::Engine;
use super::mr::{MemoryRegion, RegError, RegistrationHandle, RegistrationManager};
use super::nic::{Device, DeviceDirectory, DeviceError};
use super::type_alias::{Rank, TensorId};
use super::wr::*;
use crate::config::Config;
use crate::ctrl::Cluster;
use crate::transport::{TcpTransport, Transport, TransportError};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,

    /// `initialize` is discovering devices and connecting to peers. Behaves
    /// like `Uninitialized` for every other call.
    Initializing,

    Initialized,
    ShuttingDown,
    Terminated,
}

/// Session lifecycle error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `initialize` was called on a live session.
    #[error("session already initialized")]
    AlreadyInitialized,

    /// The session is not initialized, or is shutting down.
    #[error("session not initialized")]
    NotInitialized,

    /// The session has terminated and cannot be initialized again.
    #[error("session terminated")]
    SessionTerminated,

    /// Discovery found no usable device.
    #[error("no usable RDMA device found")]
    NoDeviceAvailable,

    /// Discovery itself failed.
    #[error("device discovery failed")]
    DeviceDiscoveryFailed(#[source] DeviceError),

    /// The configuration has no `[p2p.cluster]` table.
    #[error("no cluster configured")]
    NoCluster,

    /// Connecting to peers failed.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// Failed to spawn engine threads.
    #[error("I/O error")]
    IoError(#[from] io::Error),
}

impl From<DeviceError> for SessionError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NoDeviceAvailable => SessionError::NoDeviceAvailable,
            e => SessionError::DeviceDiscoveryFailed(e),
        }
    }
}

/// Everything that only exists while the session is initialized.
struct Active {
    devices: DeviceDirectory,
    registry: Arc<RegistrationManager>,
    engine: Engine,
}

enum Lifecycle {
    Uninitialized,
    Initializing,
    Initialized(Active),
    ShuttingDown,
    Terminated,
}

impl Lifecycle {
    fn state(&self) -> SessionState {
        match self {
            Lifecycle::Uninitialized => SessionState::Uninitialized,
            Lifecycle::Initializing => SessionState::Initializing,
            Lifecycle::Initialized(_) => SessionState::Initialized,
            Lifecycle::ShuttingDown => SessionState::ShuttingDown,
            Lifecycle::Terminated => SessionState::Terminated,
        }
    }

    #[inline]
    fn active(&self) -> Result<&Active, SessionError> {
        match self {
            Lifecycle::Initialized(active) => Ok(active),
            _ => Err(SessionError::NotInitialized),
        }
    }
}

/// A process's point-to-point transport session.
///
/// A session owns exactly one transport endpoint, i.e., it *is* its rank on
/// the fabric; there is no process-wide state. It goes through
/// [`SessionState`]s strictly in order and can be initialized only once.
///
/// All methods take `&self`, so a session can be shared between threads
/// (e.g., in an `Arc`) with no caller-side locking. [`send`](Self::send) and
/// [`recv`](Self::recv) never block; the completion pops are the only
/// blocking calls.
///
/// Dropping an initialized session shuts it down.
pub struct Session {
    config: Config,
    transport: Arc<dyn Transport>,
    lifecycle: RwLock<Lifecycle>,
    send_cq: Arc<CompletionQueue>,
    recv_cq: Arc<CompletionQueue>,
}

impl Session {
    /// Create an uninitialized session on the given transport endpoint.
    pub fn new<T: Transport + 'static>(config: Config, transport: T) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            send_cq: Arc::new(CompletionQueue::new()),
            recv_cq: Arc::new(CompletionQueue::new()),
        }
    }

    /// Create an uninitialized session on a TCP fabric described by the
    /// `[p2p.cluster]` table of the configuration.
    pub fn over_tcp(config: Config) -> Result<Self, SessionError> {
        let cluster = config
            .cluster
            .as_ref()
            .and_then(Cluster::from_config)
            .ok_or(SessionError::NoCluster)?;
        let transport = TcpTransport::new(cluster, config.io_timeout())
            .with_max_message(config.max_message_bytes);
        Ok(Self::new(config, transport))
    }

    /// Discover devices, connect to every peer and start the engine.
    ///
    /// The session reports [`SessionState::Initializing`] meanwhile; other
    /// calls do not wait for the connection to be set up. On failure the
    /// session goes back to uninitialized.
    pub fn initialize(&self) -> Result<(), SessionError> {
        {
            let mut lifecycle = self.lifecycle.write();
            match *lifecycle {
                Lifecycle::Uninitialized => *lifecycle = Lifecycle::Initializing,
                Lifecycle::Initializing | Lifecycle::Initialized(_) | Lifecycle::ShuttingDown => {
                    return Err(SessionError::AlreadyInitialized)
                }
                Lifecycle::Terminated => return Err(SessionError::SessionTerminated),
            }
        }

        let started = self.start();
        let mut lifecycle = self.lifecycle.write();
        match started {
            Ok(active) => {
                *lifecycle = Lifecycle::Initialized(active);
                log::info!(
                    "rrp2p: rank {} of {} initialized",
                    self.rank(),
                    self.world_size()
                );
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::Uninitialized;
                Err(e)
            }
        }
    }

    fn start(&self) -> Result<Active, SessionError> {
        let devices = DeviceDirectory::discover(&self.config, self.rank())?;
        self.transport.connect()?;

        let registry = Arc::new(RegistrationManager::new(
            devices.local_device().clone(),
            &self.config,
        ));
        let (send_cq, recv_cq) = self
            .send_cq
            .sender()
            .zip(self.recv_cq.sender())
            .ok_or(SessionError::SessionTerminated)?;
        let engine = Engine::start(self.transport.clone(), registry.clone(), send_cq, recv_cq)?;

        Ok(Active {
            devices,
            registry,
            engine,
        })
    }

    /// Shut the session down.
    ///
    /// Admitted sends are carried out, unmatched receives complete with
    /// [`Cancelled`](super::cq::CompletionStatus::Cancelled), and every
    /// admitted request has exactly one completion entry before the
    /// completion queues close. Entries already queued stay poppable; after
    /// that, pops return [`CompletionError::Shutdown`]. Registrations still
    /// live are released.
    ///
    /// Fails with [`SessionError::NotInitialized`], changing nothing, unless
    /// the session is initialized.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        let mut active = {
            let mut lifecycle = self.lifecycle.write();
            match mem::replace(&mut *lifecycle, Lifecycle::ShuttingDown) {
                Lifecycle::Initialized(active) => active,
                other => {
                    *lifecycle = other;
                    return Err(SessionError::NotInitialized);
                }
            }
        };
        log::info!("rrp2p: rank {} shutting down", self.rank());

        // Nothing can be admitted any more; finish what has been.
        active.engine.drain();

        let leaked = active.registry.drain_all();
        if leaked > 0 {
            log::warn!(
                "rrp2p: rank {} force-deregistered {} region(s) at shutdown",
                self.rank(),
                leaked
            );
        }

        self.send_cq.close();
        self.recv_cq.close();
        self.transport.close();
        active.engine.join_pump();
        drop(active);

        *self.lifecycle.write() = Lifecycle::Terminated;
        log::info!("rrp2p: rank {} terminated", self.rank());
        Ok(())
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.lifecycle.read().state()
    }

    /// Rank of this process.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    /// Number of ranks in the job.
    #[inline]
    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    /// All devices visible to this process, in a fixed order.
    pub fn list_devices(&self) -> Result<Vec<Device>, SessionError> {
        Ok(self.lifecycle.read().active()?.devices.list().to_vec())
    }

    /// The device this process transfers through.
    pub fn local_device(&self) -> Result<Device, SessionError> {
        Ok(self.lifecycle.read().active()?.devices.local_device().clone())
    }

    /// Index of the accelerator this process drives.
    pub fn local_gpu(&self) -> Result<usize, SessionError> {
        Ok(self.lifecycle.read().active()?.devices.local_gpu())
    }

    /// Register `len` bytes at `addr` for transfers.
    ///
    /// # Safety
    ///
    /// - `addr` must point to memory valid for reads and writes of `len`
    ///   bytes until the handle is deregistered or the session shuts down.
    /// - While a transfer through the handle is outstanding, the caller must
    ///   not access the transferred bytes.
    pub unsafe fn register_memory(
        &self,
        addr: *mut u8,
        len: usize,
    ) -> Result<RegistrationHandle, RegError> {
        let lifecycle = self.lifecycle.read();
        lifecycle.active()?.registry.register(addr, len)
    }

    /// Release a registration.
    pub fn deregister_memory(&self, handle: RegistrationHandle) -> Result<(), RegError> {
        let lifecycle = self.lifecycle.read();
        lifecycle.active()?.registry.deregister(handle)
    }

    /// The region a live handle was registered with.
    pub fn registered_region(&self, handle: RegistrationHandle) -> Result<MemoryRegion, RegError> {
        let lifecycle = self.lifecycle.read();
        lifecycle.active()?.registry.region(handle)
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> Result<usize, SessionError> {
        Ok(self.lifecycle.read().active()?.registry.len())
    }

    /// Total bytes covered by live registrations.
    pub fn registered_bytes(&self) -> Result<usize, SessionError> {
        Ok(self.lifecycle.read().active()?.registry.registered_bytes())
    }

    /// Send the first `length` bytes of `region` to `dst` under `tensor_id`.
    ///
    /// Returns as soon as the request is validated and queued. Its outcome is
    /// reported by exactly one entry on the send completion queue, carrying
    /// `context`. A rejected call produces no entry.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        dst: Rank,
        region: MemoryRegion,
        handle: RegistrationHandle,
        length: usize,
        tensor_id: TensorId,
        context: TransferContext,
        flags: TransferFlags,
    ) -> Result<(), SendError> {
        self.post(
            Direction::Send,
            dst,
            region,
            handle,
            length,
            tensor_id,
            context,
            flags,
        )
    }

    /// Receive up to `length` bytes from `src` under `tensor_id` into
    /// `region`.
    ///
    /// Receives from the same source with the same tag are matched with
    /// incoming sends in issue order. The outcome is reported by exactly one
    /// entry on the receive completion queue.
    #[allow(clippy::too_many_arguments)]
    pub fn recv(
        &self,
        src: Rank,
        region: MemoryRegion,
        handle: RegistrationHandle,
        length: usize,
        tensor_id: TensorId,
        context: TransferContext,
        flags: TransferFlags,
    ) -> Result<(), RecvError> {
        self.post(
            Direction::Recv,
            src,
            region,
            handle,
            length,
            tensor_id,
            context,
            flags,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn post(
        &self,
        direction: Direction,
        peer: Rank,
        region: MemoryRegion,
        handle: RegistrationHandle,
        length: usize,
        tensor_id: TensorId,
        context: TransferContext,
        flags: TransferFlags,
    ) -> Result<(), TransferError> {
        // Held until the request is queued, so shutdown cannot slip in
        // between admission and submission.
        let lifecycle = self.lifecycle.read();
        let active = lifecycle.active()?;

        let world_size = self.world_size();
        if peer >= world_size || peer == self.rank() {
            return Err(TransferError::InvalidRank {
                rank: peer,
                world_size,
            });
        }
        if flags.reserved_bits() != 0 {
            return Err(TransferError::ReservedFlags(flags.reserved_bits()));
        }
        active.registry.acquire(handle, &region, length)?;

        let req = TransferRequest {
            direction,
            peer,
            region,
            handle,
            length,
            tensor_id,
            context,
            issued: quanta::Instant::now(),
        };
        if let Err(handle) = active.engine.submit(req) {
            active.registry.release(handle);
            return Err(SessionError::NotInitialized.into());
        }
        Ok(())
    }

    /// Requests admitted but not completed yet.
    pub fn outstanding(&self) -> usize {
        self.lifecycle
            .read()
            .active()
            .map_or(0, |active| active.engine.outstanding())
    }

    fn pollable(&self) -> Result<(), CompletionError> {
        match self.state() {
            SessionState::Uninitialized | SessionState::Initializing => {
                Err(CompletionError::NotInitialized)
            }
            _ => Ok(()),
        }
    }

    /// Blockingly pop the oldest send completion.
    ///
    /// Fails with [`CompletionError::Shutdown`] once the session has shut
    /// down and every entry has been popped. A thread blocked here when that
    /// happens is woken.
    pub fn pop_send_completion(&self) -> Result<CompletionEntry, CompletionError> {
        self.pollable()?;
        self.send_cq.pop()
    }

    /// Blockingly pop the oldest receive completion.
    pub fn pop_recv_completion(&self) -> Result<CompletionEntry, CompletionError> {
        self.pollable()?;
        self.recv_cq.pop()
    }

    /// Pop the oldest send completion if there is one.
    pub fn try_pop_send_completion(&self) -> Result<Option<CompletionEntry>, CompletionError> {
        self.pollable()?;
        self.send_cq.try_pop()
    }

    /// Pop the oldest receive completion if there is one.
    pub fn try_pop_recv_completion(&self) -> Result<Option<CompletionEntry>, CompletionError> {
        self.pollable()?;
        self.recv_cq.try_pop()
    }

    /// Like [`pop_send_completion`](Self::pop_send_completion), but gives up
    /// with `Ok(None)` after `timeout`.
    pub fn pop_send_completion_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<CompletionEntry>, CompletionError> {
        self.pollable()?;
        self.send_cq.pop_timeout(timeout)
    }

    /// Like [`pop_recv_completion`](Self::pop_recv_completion), but gives up
    /// with `Ok(None)` after `timeout`.
    pub fn pop_recv_completion_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<CompletionEntry>, CompletionError> {
        self.pollable()?;
        self.recv_cq.pop_timeout(timeout)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == SessionState::Initialized {
            if let Err(e) = self.shutdown() {
                log::error!("rrp2p: shutdown on drop failed: {}", e);
            }
        }
    }
}
