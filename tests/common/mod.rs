#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rrp2p::*;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn config() -> Config {
    Config::with_devices(["mlx5_1", "mlx5_0"])
}

/// Initialized sessions for every rank of a fresh loopback fabric.
pub fn loopback(world_size: usize) -> Vec<Arc<Session>> {
    LoopbackFabric::endpoints(world_size)
        .into_iter()
        .map(|ep| {
            let s = Session::new(config(), ep);
            s.initialize().unwrap();
            Arc::new(s)
        })
        .collect()
}

/// A heap buffer registered with a session.
pub struct Registered {
    pub buf: Vec<u8>,
    pub handle: RegistrationHandle,
}

impl Registered {
    pub fn new(session: &Session, mut buf: Vec<u8>) -> Self {
        let handle = unsafe { session.register_memory(buf.as_mut_ptr(), buf.len()) }.unwrap();
        Self { buf, handle }
    }

    pub fn zeroed(session: &Session, len: usize) -> Self {
        Self::new(session, vec![0; len])
    }

    pub fn region(&mut self) -> MemoryRegion {
        MemoryRegion::from_slice(&mut self.buf)
    }
}

pub fn pop_send(session: &Session) -> CompletionEntry {
    session
        .pop_send_completion_timeout(WAIT)
        .unwrap()
        .expect("no send completion in time")
}

pub fn pop_recv(session: &Session) -> CompletionEntry {
    session
        .pop_recv_completion_timeout(WAIT)
        .unwrap()
        .expect("no recv completion in time")
}
