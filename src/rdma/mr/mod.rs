//! Memory registration.
//!
//! Registrations live in an arena. A [`RegistrationHandle`] is an index into
//! the arena plus the generation of the slot at registration time, so a
//! handle that has been deregistered (or never existed) is detected and
//! rejected rather than dereferenced.

mod region;

use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

pub use self::region::*;
use super::nic::Device;
use super::session::SessionError;
use super::wr::TransferError;
use crate::config::Config;
use crate::utils::interop;

/// Opaque token proving that a memory region is registered for transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    slot: u32,
    generation: u32,
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mr#{}.{}", self.slot, self.generation)
    }
}

/// Registration error type.
#[derive(Debug, Error)]
pub enum RegError {
    /// The device rejected the region.
    #[error("registration rejected: {0}")]
    RegistrationFailed(String),

    /// The handle is unknown or already deregistered.
    #[error("invalid registration handle")]
    InvalidHandle,

    /// Transfers referencing the region are still outstanding.
    #[error("region is referenced by {0} outstanding transfer(s)")]
    RegionInUse(usize),

    /// The session is not in a state that accepts registrations.
    #[error(transparent)]
    Session(#[from] SessionError),
}

struct Registration {
    region: MemoryRegion,

    /// Admitted transfers that have not completed yet.
    inflight: usize,

    pinned: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Registration>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    registered_bytes: usize,
    live: usize,
}

impl Table {
    fn get_mut(&mut self, handle: RegistrationHandle) -> Option<&mut Registration> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Empty a slot and retire its generation.
    fn vacate(&mut self, slot: u32) -> Option<Registration> {
        let s = &mut self.slots[slot as usize];
        let reg = s.entry.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.free.push(slot);
        self.registered_bytes -= reg.region.len();
        self.live -= 1;
        Some(reg)
    }
}

/// Registers caller-owned memory with the local device.
///
/// Every operation takes the table lock once, so registrations,
/// deregistrations and transfer admissions are linearizable.
pub(crate) struct RegistrationManager {
    device: Device,
    table: Mutex<Table>,
    max_registered_bytes: Option<usize>,
    pin_host_memory: bool,
}

impl RegistrationManager {
    pub(crate) fn new(device: Device, cfg: &Config) -> Self {
        Self {
            device,
            table: Mutex::new(Table::default()),
            max_registered_bytes: cfg.max_registered_bytes,
            pin_host_memory: cfg.pin_host_memory,
        }
    }

    /// Register `len` bytes at `addr`.
    ///
    /// A failed registration leaves no trace.
    ///
    /// # Safety
    ///
    /// - `addr` must point to memory valid for reads and writes of `len`
    ///   bytes until the returned handle is deregistered or the session
    ///   shuts down.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
    ) -> Result<RegistrationHandle, RegError> {
        if len == 0 {
            return Err(RegError::RegistrationFailed("zero-length region".to_owned()));
        }
        if addr.is_null() {
            return Err(RegError::RegistrationFailed("null address".to_owned()));
        }
        if (addr as usize).checked_add(len).is_none() {
            return Err(RegError::RegistrationFailed(
                "region wraps around the address space".to_owned(),
            ));
        }

        let mut table = self.table.lock();
        let total = table.registered_bytes.checked_add(len).ok_or_else(|| {
            RegError::RegistrationFailed("registered byte count overflows".to_owned())
        })?;
        if let Some(max) = self.max_registered_bytes {
            if total > max {
                return Err(RegError::RegistrationFailed(format!(
                    "registration budget exhausted ({} of {} bytes in use, {} requested)",
                    table.registered_bytes, max, len
                )));
            }
        }
        if self.pin_host_memory {
            interop::pin(addr as usize, len)
                .map_err(|e| RegError::RegistrationFailed(format!("cannot pin memory: {e}")))?;
        }

        let region = MemoryRegion::new(addr, len);
        let entry = Registration {
            region,
            inflight: 0,
            pinned: self.pin_host_memory,
        };
        let slot = match table.free.pop() {
            Some(slot) => slot,
            None => {
                table.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (table.slots.len() - 1) as u32
            }
        };
        let s = &mut table.slots[slot as usize];
        s.entry = Some(entry);
        let handle = RegistrationHandle {
            slot,
            generation: s.generation,
        };
        table.registered_bytes = total;
        table.live += 1;

        log::debug!(
            "rrp2p: registered {:?} on {} as {}",
            region,
            self.device,
            handle
        );
        Ok(handle)
    }

    /// Release a registration.
    ///
    /// Fails with [`RegError::RegionInUse`] while admitted transfers still
    /// reference it; the handle stays valid in that case.
    pub fn deregister(&self, handle: RegistrationHandle) -> Result<(), RegError> {
        let mut table = self.table.lock();
        let reg = table.get_mut(handle).ok_or(RegError::InvalidHandle)?;
        if reg.inflight > 0 {
            return Err(RegError::RegionInUse(reg.inflight));
        }

        let reg = table.vacate(handle.slot);
        drop(table);
        if let Some(reg) = reg {
            Self::unpin(&reg);
            log::debug!("rrp2p: deregistered {} ({:?})", handle, reg.region);
        }
        Ok(())
    }

    /// The region a handle was registered with.
    pub fn region(&self, handle: RegistrationHandle) -> Result<MemoryRegion, RegError> {
        self.table
            .lock()
            .get_mut(handle)
            .map(|reg| reg.region)
            .ok_or(RegError::InvalidHandle)
    }

    /// Admit a transfer of `length` bytes of `region` through `handle`.
    ///
    /// On success the registration counts the transfer as in flight until
    /// [`release`](Self::release) is called for it.
    pub(crate) fn acquire(
        &self,
        handle: RegistrationHandle,
        region: &MemoryRegion,
        length: usize,
    ) -> Result<(), TransferError> {
        let mut table = self.table.lock();
        let reg = table
            .get_mut(handle)
            .filter(|reg| reg.region.contains(region))
            .ok_or(TransferError::InvalidHandle)?;
        if length > region.len() {
            return Err(TransferError::LengthExceedsRegion {
                length,
                region: region.len(),
            });
        }
        reg.inflight += 1;
        Ok(())
    }

    /// Mark a transfer admitted by [`acquire`](Self::acquire) as finished.
    pub(crate) fn release(&self, handle: RegistrationHandle) {
        if let Some(reg) = self.table.lock().get_mut(handle) {
            reg.inflight = reg.inflight.saturating_sub(1);
        }
    }

    /// Deregister everything. Returns the number of registrations released.
    pub(crate) fn drain_all(&self) -> usize {
        let mut table = self.table.lock();
        let live = (0..table.slots.len() as u32)
            .filter(|&slot| table.slots[slot as usize].entry.is_some())
            .collect::<Vec<_>>();
        let released = live
            .into_iter()
            .filter_map(|slot| table.vacate(slot))
            .collect::<Vec<_>>();
        drop(table);

        for reg in &released {
            Self::unpin(reg);
        }
        released.len()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.table.lock().live
    }

    /// Total bytes covered by live registrations.
    pub fn registered_bytes(&self) -> usize {
        self.table.lock().registered_bytes
    }

    fn unpin(reg: &Registration) {
        if reg.pinned {
            if let Err(e) = interop::unpin(reg.region.addr() as usize, reg.region.len()) {
                log::warn!("rrp2p: cannot unpin {:?}: {}", reg.region, e);
            }
        }
    }
}
