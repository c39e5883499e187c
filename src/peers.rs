//! # Peer Records and Registry
//!
//! A [`Peer`] binds a [`NodeId`] to its derived overlay addresses and an
//! optional user-chosen name. The [`PeerRegistry`] owns all peer values and
//! keeps three indices in lockstep:
//!
//! - by id (primary)
//! - by lowercased name (named peers only; names are unique case-insensitively)
//! - by netid (the last 4 octets of the derived IPv6 address)
//!
//! CLI references resolve either `@name` (case-insensitive) or a unique prefix
//! of the id's base-36 text form.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::identity::{derive_v4, derive_v6, netid, NodeId};

/// Error type for registry mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a peer with this id already exists")]
    DuplicateId,
    #[error("a peer with this name already exists")]
    DuplicateName,
}

/// Error type for CLI peer references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RefError {
    #[error("no peer matches this reference")]
    NotFound,
    #[error("reference matches more than one peer")]
    Ambiguous,
}

// ============================================================================
// Peer
// ============================================================================

/// A configured peer. Addresses are always the derived ones; the only
/// constructor recomputes them from the id, so `addr4 == derive_v4(id)` and
/// `addr6 == derive_v6(id)` hold for every value of this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub name: Option<String>,
    pub addr4: Ipv4Addr,
    pub addr6: Ipv6Addr,
}

impl Peer {
    pub fn new(id: NodeId, name: Option<String>) -> Self {
        let name = name.filter(|n| !n.is_empty());
        Self {
            id,
            name,
            addr4: derive_v4(&id),
            addr6: derive_v6(&id),
        }
    }

    pub fn netid(&self) -> [u8; 4] {
        netid(&self.id)
    }
}

// ============================================================================
// PeerRegistry
// ============================================================================

/// Owner of all peer records, indexed three ways.
#[derive(Default)]
pub struct PeerRegistry {
    by_id: HashMap<NodeId, Peer>,
    by_name: HashMap<String, NodeId>,
    by_netid: HashMap<[u8; 4], NodeId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. On any error nothing is mutated.
    pub fn add(&mut self, peer: Peer) -> Result<(), RegistryError> {
        if self.by_id.contains_key(&peer.id) {
            return Err(RegistryError::DuplicateId);
        }
        let name_key = peer.name.as_deref().map(str::to_lowercase);
        if let Some(key) = &name_key {
            if self.by_name.contains_key(key) {
                return Err(RegistryError::DuplicateName);
            }
        }

        if let Some(key) = name_key {
            self.by_name.insert(key, peer.id);
        }
        self.by_netid.insert(peer.netid(), peer.id);
        self.by_id.insert(peer.id, peer);
        Ok(())
    }

    pub fn remove_by_id(&mut self, id: &NodeId) -> Option<Peer> {
        let peer = self.by_id.remove(id)?;
        if let Some(name) = &peer.name {
            self.by_name.remove(&name.to_lowercase());
        }
        self.by_netid.remove(&peer.netid());
        Some(peer)
    }

    pub fn find_by_id(&self, id: &NodeId) -> Option<&Peer> {
        self.by_id.get(id)
    }

    pub fn find_by_name_ci(&self, name: &str) -> Option<&Peer> {
        let id = self.by_name.get(&name.to_lowercase())?;
        self.by_id.get(id)
    }

    pub fn find_by_netid(&self, netid: &[u8; 4]) -> Option<&Peer> {
        let id = self.by_netid.get(netid)?;
        self.by_id.get(id)
    }

    /// Match the unique peer whose base-36 id text starts with `prefix`.
    pub fn find_by_id_prefix(&self, prefix: &str) -> Result<&Peer, RefError> {
        let mut found = None;
        for peer in self.by_id.values() {
            if peer.id.to_base36().starts_with(prefix) {
                if found.is_some() {
                    return Err(RefError::Ambiguous);
                }
                found = Some(peer);
            }
        }
        found.ok_or(RefError::NotFound)
    }

    /// Resolve a CLI reference: `@name` looks up by case-insensitive name,
    /// anything else is an id text prefix.
    pub fn find_by_cli_ref(&self, reference: &str) -> Result<&Peer, RefError> {
        match reference.strip_prefix('@') {
            Some(name) => self.find_by_name_ci(name).ok_or(RefError::NotFound),
            None => self.find_by_id_prefix(reference),
        }
    }

    /// All peers, ordered by id for stable output.
    pub fn list(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self.by_id.values().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_v4;

    fn id(seed: u8) -> NodeId {
        NodeId::from_bytes(*blake3::hash(&[seed]).as_bytes())
    }

    fn registry(peers: &[(u8, &str)]) -> PeerRegistry {
        let mut reg = PeerRegistry::new();
        for (seed, name) in peers {
            reg.add(Peer::new(id(*seed), Some(name.to_string()))).unwrap();
        }
        reg
    }

    #[test]
    fn peer_addresses_are_derived() {
        let peer = Peer::new(id(1), Some("alice".into()));
        assert_eq!(peer.addr4, derive_v4(&id(1)));
        assert_eq!(peer.addr6, crate::identity::derive_v6(&id(1)));
        assert_eq!(peer.netid(), crate::identity::netid(&id(1)));
    }

    #[test]
    fn empty_name_becomes_unnamed() {
        let peer = Peer::new(id(1), Some(String::new()));
        assert_eq!(peer.name, None);
    }

    #[test]
    fn indices_stay_in_lockstep() {
        let reg = registry(&[(1, "alice"), (2, "bob")]);
        assert_eq!(reg.len(), 2);

        let alice = reg.find_by_id(&id(1)).unwrap();
        assert_eq!(reg.find_by_name_ci("alice").unwrap().id, alice.id);
        assert_eq!(reg.find_by_netid(&alice.netid()).unwrap().id, alice.id);
    }

    #[test]
    fn duplicate_id_rejected_without_mutation() {
        let mut reg = registry(&[(1, "alice")]);
        let err = reg.add(Peer::new(id(1), Some("other".into()))).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId);
        assert_eq!(reg.len(), 1);
        assert!(reg.find_by_name_ci("other").is_none());
    }

    #[test]
    fn duplicate_name_rejected_case_insensitively() {
        let mut reg = registry(&[(1, "alice")]);
        let err = reg.add(Peer::new(id(2), Some("ALICE".into()))).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName);
        assert_eq!(reg.len(), 1);
        // The id index must not have been touched by the failed add.
        assert!(reg.find_by_id(&id(2)).is_none());
    }

    #[test]
    fn unnamed_peers_skip_the_name_index() {
        let mut reg = PeerRegistry::new();
        reg.add(Peer::new(id(1), None)).unwrap();
        reg.add(Peer::new(id(2), None)).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_clears_all_indices() {
        let mut reg = registry(&[(1, "alice")]);
        let netid = reg.find_by_id(&id(1)).unwrap().netid();
        let removed = reg.remove_by_id(&id(1)).unwrap();
        assert_eq!(removed.id, id(1));
        assert!(reg.find_by_id(&id(1)).is_none());
        assert!(reg.find_by_name_ci("alice").is_none());
        assert!(reg.find_by_netid(&netid).is_none());
        assert!(reg.remove_by_id(&id(1)).is_none());
    }

    #[test]
    fn cli_ref_by_name_is_case_insensitive() {
        let reg = registry(&[(1, "alice"), (2, "alicia")]);
        assert_eq!(reg.find_by_cli_ref("@alice").unwrap().id, id(1));
        assert_eq!(reg.find_by_cli_ref("@ALICE").unwrap().id, id(1));
        assert_eq!(reg.find_by_cli_ref("@nobody"), Err(RefError::NotFound));
    }

    #[test]
    fn cli_ref_by_unique_id_prefix() {
        let reg = registry(&[(1, "alice"), (2, "alicia")]);
        let full = id(1).to_base36();

        // A long prefix is unique.
        assert_eq!(reg.find_by_cli_ref(&full[..12]).unwrap().id, id(1));
        // The shared leading "k" matches both peers.
        assert_eq!(reg.find_by_cli_ref("k"), Err(RefError::Ambiguous));
        // A prefix matching nothing fails.
        assert_eq!(reg.find_by_cli_ref("zzzz"), Err(RefError::NotFound));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let reg = registry(&[(3, "c"), (1, "a"), (2, "b")]);
        let ids: Vec<NodeId> = reg.list().iter().map(|p| p.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 3);
    }
}
