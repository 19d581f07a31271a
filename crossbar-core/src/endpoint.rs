//! Endpoint registry
//!
//! Maps logical peer ids to network addresses. Two disjoint id ranges
//! exist: stable ids, minted when an address is registered, and transient
//! ids, minted for accepted connections whose greeting has not arrived
//! yet. Ids are never deleted.
//!
//! A transient endpoint must never reach user-level `send`; the event loop
//! rebinds (or closes) such connections once the peer identifies itself.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};

/// A logical peer identity.
pub type EndpointId = u64;

/// First id of the transient range.
pub const TRANSIENT_BASE: EndpointId = 1 << 63;

struct Registry {
    by_addr: HashMap<SocketAddr, EndpointId>,
    addrs: HashMap<EndpointId, SocketAddr>,
    next_stable: EndpointId,
    next_transient: EndpointId,
}

/// Endpoint id ↔ address registry, shared between buses and their callers.
pub struct EndpointManager {
    inner: Mutex<Registry>,
}

impl EndpointManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                by_addr: HashMap::new(),
                addrs: HashMap::new(),
                next_stable: 1,
                next_transient: TRANSIENT_BASE,
            }),
        }
    }

    /// Stable id for `addr`, minting one on first sight.
    pub fn register(&self, addr: SocketAddr) -> EndpointId {
        let mut registry = self.inner.lock();
        if let Some(&id) = registry.by_addr.get(&addr) {
            return id;
        }
        let id = registry.next_stable;
        registry.next_stable += 1;
        registry.by_addr.insert(addr, id);
        registry.addrs.insert(id, addr);
        id
    }

    /// Stable id for a peer that announced `port` from address `ip`.
    pub fn resolve(&self, ip: IpAddr, port: u16) -> EndpointId {
        self.register(SocketAddr::new(ip, port))
    }

    /// Address a stable id resolves to; `None` for transient or unknown ids.
    #[must_use]
    pub fn address_of(&self, id: EndpointId) -> Option<SocketAddr> {
        self.inner.lock().addrs.get(&id).copied()
    }

    /// Placeholder id for an accepted, not-yet-greeted connection.
    pub fn make_transient(&self) -> EndpointId {
        let mut registry = self.inner.lock();
        let id = registry.next_transient;
        registry.next_transient += 1;
        id
    }

    /// Whether `id` belongs to the transient range.
    #[must_use]
    pub fn transient(&self, id: EndpointId) -> bool {
        id >= TRANSIENT_BASE
    }
}

impl Default for EndpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_address() {
        let manager = EndpointManager::new();
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let id = manager.register(addr);
        assert_eq!(manager.register(addr), id);
        assert_eq!(manager.address_of(id), Some(addr));
        assert!(!manager.transient(id));
    }

    #[test]
    fn resolve_matches_register() {
        let manager = EndpointManager::new();
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let id = manager.register(addr);
        assert_eq!(manager.resolve(addr.ip(), addr.port()), id);
    }

    #[test]
    fn transient_ids_have_no_address() {
        let manager = EndpointManager::new();
        let id = manager.make_transient();
        assert!(manager.transient(id));
        assert_eq!(manager.address_of(id), None);
        assert_ne!(manager.make_transient(), id);
    }
}
