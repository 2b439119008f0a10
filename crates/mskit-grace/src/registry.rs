//! Process-wide table of services keyed by bind address.
//!
//! Ordinals are assigned once, at registration, in registration order. A child
//! process seeds its registry from the address order its parent passed on the
//! command line, so descriptor `3 + ordinal` always belongs to the same address
//! in both processes.

use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{GraceError, Result};
use crate::service::Service;

/// One service's descriptor captured for a restart.
#[derive(Debug)]
pub struct SnapshotEntry {
    pub ordinal: usize,
    pub address: String,
    pub descriptor: OwnedFd,
}

#[derive(Debug)]
struct Slot {
    address: String,
    /// Held from `reserve` until the service is attached or the reservation released.
    claimed: bool,
    service: Option<Arc<Service>>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    ordinals: HashMap<String, usize>,
    slots: Vec<Slot>,
    restart_triggered: bool,
}

/// Address → ordinal → service table plus the restart guard.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    inner: Mutex<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for a restarted process: ordinals fixed by the parent's order.
    pub fn with_order<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        {
            let mut inner = registry.inner.lock();
            for address in addresses {
                let address = address.into();
                if inner.ordinals.contains_key(&address) {
                    warn!(address, "Duplicate address in inherited socket order, ignoring");
                    continue;
                }
                let ordinal = inner.slots.len();
                inner.ordinals.insert(address.clone(), ordinal);
                inner.slots.push(Slot {
                    address,
                    claimed: false,
                    service: None,
                });
            }
        }
        registry
    }

    /// Claim `address` for a service that is about to start, assigning its
    /// ordinal if it has none yet. Fails if the address is already claimed.
    pub fn reserve(&self, address: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        if let Some(&ordinal) = inner.ordinals.get(address) {
            let slot = &mut inner.slots[ordinal];
            if slot.claimed {
                return Err(GraceError::AlreadyServing(address.to_string()));
            }
            slot.claimed = true;
            return Ok(ordinal);
        }
        let ordinal = inner.slots.len();
        inner.ordinals.insert(address.to_string(), ordinal);
        inner.slots.push(Slot {
            address: address.to_string(),
            claimed: true,
            service: None,
        });
        debug!(address, ordinal, "Assigned ordinal");
        Ok(ordinal)
    }

    /// Give back a reservation whose service failed to start. The ordinal stays assigned.
    pub fn release(&self, ordinal: usize) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(ordinal) {
            if slot.service.is_none() {
                slot.claimed = false;
            }
        }
    }

    /// Attach the running service to a reserved ordinal.
    pub(crate) fn attach(&self, ordinal: usize, service: Arc<Service>) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[ordinal];
        if slot.service.is_some() {
            return Err(GraceError::AlreadyServing(slot.address.clone()));
        }
        slot.claimed = true;
        slot.service = Some(service);
        Ok(())
    }

    /// Assign the next ordinal to `address` (if new) and record its service.
    pub fn register(&self, address: &str, service: Arc<Service>) -> Result<usize> {
        let ordinal = self.reserve(address)?;
        self.attach(ordinal, service)?;
        Ok(ordinal)
    }

    /// Ordinal of `address`, or `None` if it was never assigned.
    pub fn ordinal_of(&self, address: &str) -> Option<usize> {
        self.inner.lock().ordinals.get(address).copied()
    }

    /// Number of assigned ordinals.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses in ordinal order.
    pub fn addresses(&self) -> Vec<String> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|slot| slot.address.clone())
            .collect()
    }

    /// Ordinals and addresses that have no running service, in ordinal order.
    pub fn unattached(&self) -> Vec<(usize, String)> {
        self.inner
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.service.is_none())
            .map(|(ordinal, slot)| (ordinal, slot.address.clone()))
            .collect()
    }

    /// Running services in ordinal order.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.inner
            .lock()
            .slots
            .iter()
            .filter_map(|slot| slot.service.clone())
            .collect()
    }

    /// Duplicate every open listener's descriptor, in ordinal order, under one lock.
    ///
    /// Services whose listener is already closed (draining) are left out.
    pub fn snapshot(&self) -> std::io::Result<Vec<SnapshotEntry>> {
        let inner = self.inner.lock();
        let mut entries = Vec::with_capacity(inner.slots.len());
        for (ordinal, slot) in inner.slots.iter().enumerate() {
            let Some(service) = &slot.service else {
                continue;
            };
            if service.listener().is_closed() {
                debug!(address = %slot.address, ordinal, "Skipping closed listener in snapshot");
                continue;
            }
            entries.push(SnapshotEntry {
                ordinal,
                address: slot.address.clone(),
                descriptor: service.listener().extract_descriptor()?,
            });
        }
        Ok(entries)
    }

    /// Set the restart guard. Returns `false` if a restart is already in progress.
    pub fn try_begin_restart(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.restart_triggered {
            return false;
        }
        inner.restart_triggered = true;
        true
    }

    /// Clear the restart guard after a failed or abandoned restart.
    pub fn clear_restart(&self) {
        self.inner.lock().restart_triggered = false;
    }

    pub fn restart_in_progress(&self) -> bool {
        self.inner.lock().restart_triggered
    }
}
