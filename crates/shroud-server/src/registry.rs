//! Hostname to tunnel routing table
//!
//! A hostname is bound by at most one tunnel. Binding is two-phase: a
//! [`Reservation`] claims the name while the tunnel handshake finishes, and
//! is released automatically if the handshake fails.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shroud_transport_h2::ProxyTunnel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("The hostname {0} is already bound by another tunnel")]
    AlreadyBound(String),
}

/// What the registry needs to know about a tunnel
pub trait RoutedTunnel: Send + Sync {
    fn id(&self) -> u64;
    fn is_closed(&self) -> bool;
}

impl RoutedTunnel for ProxyTunnel {
    fn id(&self) -> u64 {
        ProxyTunnel::id(self)
    }

    fn is_closed(&self) -> bool {
        ProxyTunnel::is_closed(self)
    }
}

enum Slot<T> {
    Reserved(u64),
    Bound(Arc<T>),
}

impl<T: RoutedTunnel> Slot<T> {
    /// A closed tunnel that was not unregistered yet
    fn is_stale(&self) -> bool {
        matches!(self, Slot::Bound(tunnel) if tunnel.is_closed())
    }
}

/// Routing table for the public listener
pub struct TunnelRegistry<T = ProxyTunnel> {
    slots: DashMap<String, Slot<T>>,
    next_reservation: AtomicU64,
}

impl<T: RoutedTunnel> Default for TunnelRegistry<T> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
            next_reservation: AtomicU64::new(1),
        }
    }
}

impl<T: RoutedTunnel> TunnelRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `hostname` for a tunnel that is about to be established
    pub fn reserve(self: &Arc<Self>, hostname: &str) -> Result<Reservation<T>, RegistryError> {
        let key = hostname.to_ascii_lowercase();
        let id = self.next_reservation.fetch_add(1, Ordering::Relaxed);

        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_stale() {
                    return Err(RegistryError::AlreadyBound(key));
                }
                debug!("Replacing closed tunnel for {}", key);
                occupied.insert(Slot::Reserved(id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Reserved(id));
            }
        }

        trace!("Reserved {}", key);
        Ok(Reservation {
            registry: self.clone(),
            hostname: key,
            id,
            bound: false,
        })
    }

    /// The live tunnel bound to `hostname`
    pub fn lookup(&self, hostname: &str) -> Option<Arc<T>> {
        let key = hostname.to_ascii_lowercase();
        match self.slots.get(&key).as_deref() {
            Some(Slot::Bound(tunnel)) if !tunnel.is_closed() => Some(tunnel.clone()),
            _ => None,
        }
    }

    /// Remove `hostname` if it is still bound to the tunnel `tunnel_id`
    pub fn unregister(&self, hostname: &str, tunnel_id: u64) -> bool {
        let key = hostname.to_ascii_lowercase();
        let removed = self
            .slots
            .remove_if(&key, |_, slot| matches!(slot, Slot::Bound(t) if t.id() == tunnel_id))
            .is_some();
        if removed {
            debug!("Unregistered {}", key);
        }
        removed
    }

    /// Number of hostnames bound or reserved
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Claim on a hostname; released on drop unless bound
pub struct Reservation<T: RoutedTunnel = ProxyTunnel> {
    registry: Arc<TunnelRegistry<T>>,
    hostname: String,
    id: u64,
    bound: bool,
}

impl<T: RoutedTunnel> Reservation<T> {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Route `hostname` to `tunnel`
    pub fn bind(mut self, tunnel: Arc<T>) {
        if let Some(mut slot) = self.registry.slots.get_mut(&self.hostname) {
            if matches!(*slot, Slot::Reserved(id) if id == self.id) {
                *slot = Slot::Bound(tunnel);
                self.bound = true;
                debug!("Bound {}", self.hostname);
            }
        }
    }
}

impl<T: RoutedTunnel> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.bound {
            return;
        }
        let id = self.id;
        self.registry
            .slots
            .remove_if(&self.hostname, |_, slot| matches!(slot, Slot::Reserved(r) if *r == id));
    }
}
