//! # Recursion Gate
//!
//! Peers publish underlay addresses, and nothing stops one of those addresses
//! from falling inside a prefix the overlay itself routes. Dialing such an
//! address through the kernel would send the handshake back into the TUN
//! interface and through the overlay, which deadlocks. The gate vetoes those
//! dials before they leave the process.
//!
//! Policy: an IPv4 underlay address whose longest-prefix-match in the route
//! table targets the very peer being dialed is allowed (the peer advertises
//! its own overlay address, harmless); a match targeting a *different* peer
//! would tunnel the dial via that peer and is denied. Addresses with no
//! overlay route, and all IPv6 addresses, pass.

use std::net::SocketAddr;

use crate::config::Shared;
use crate::identity::NodeId;

/// Veto point for outbound underlay dials.
#[derive(Clone)]
pub struct DialGate {
    state: Shared,
}

impl DialGate {
    pub fn new(state: Shared) -> Self {
        Self { state }
    }

    /// Whether the underlay may dial `addr` while connecting to `target`.
    pub async fn allow_underlay_dial(&self, target: NodeId, addr: SocketAddr) -> bool {
        let ip = addr.ip();
        if !ip.is_ipv4() {
            return true;
        }
        match self.state.read().await.table.lookup_longest(ip) {
            Some(entry) => entry.target == target,
            None => true,
        }
    }

    /// Overlay-level peer dials are never gated.
    pub fn allow_peer_dial(&self, _peer: NodeId) -> bool {
        true
    }

    /// Inbound connections are never gated.
    pub fn allow_accept(&self, _addr: SocketAddr) -> bool {
        true
    }

    /// Post-handshake hooks are never gated.
    pub fn allow_secured(&self, _peer: NodeId) -> bool {
        true
    }

    pub fn allow_upgraded(&self, _peer: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetState;
    use crate::peers::PeerRegistry;
    use crate::routes::RouteTable;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn id(seed: u8) -> NodeId {
        NodeId::from_bytes(*blake3::hash(&[seed]).as_bytes())
    }

    fn state_with_route(prefix: &str, target: NodeId) -> Shared {
        let mut table = RouteTable::new();
        table.insert(prefix.parse().unwrap(), target).unwrap();
        Arc::new(RwLock::new(NetState {
            registry: PeerRegistry::new(),
            table,
        }))
    }

    #[tokio::test]
    async fn dial_into_own_route_allowed() {
        let carol = id(3);
        let gate = DialGate::new(state_with_route("192.168.5.0/24", carol));
        assert!(gate.allow_underlay_dial(carol, "192.168.5.10:4001".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn dial_into_foreign_route_denied() {
        let carol = id(3);
        let dave = id(4);
        let gate = DialGate::new(state_with_route("192.168.5.0/24", carol));
        assert!(!gate.allow_underlay_dial(dave, "192.168.5.10:4001".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn unrouted_and_v6_addresses_pass() {
        let gate = DialGate::new(state_with_route("192.168.5.0/24", id(3)));
        assert!(gate.allow_underlay_dial(id(4), "8.8.8.8:4001".parse().unwrap()).await);
        // IPv6 recursion is out of scope; always allowed.
        assert!(gate.allow_underlay_dial(id(4), "[2001:db8::1]:4001".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn auxiliary_hooks_always_allow() {
        let gate = DialGate::new(state_with_route("192.168.5.0/24", id(3)));
        assert!(gate.allow_peer_dial(id(9)));
        assert!(gate.allow_accept("127.0.0.1:1".parse().unwrap()));
        assert!(gate.allow_secured(id(9)));
        assert!(gate.allow_upgraded(id(9)));
    }
}
