//! # Overlay Route Table
//!
//! Longest-prefix-match routing over mixed IPv4/IPv6 prefixes. The table is a
//! pair of binary prefix tries (one per address family) behind a thin
//! dispatching wrapper, so a lookup touches at most `prefix length` nodes.
//!
//! The table is a function of prefix → target: inserting a prefix that is
//! already present is an error regardless of target, which keeps replace
//! explicit (remove, then insert) and makes lookups unambiguous.
//!
//! Iteration order from [`RouteTable::list_all`] is deterministic (ascending
//! prefix address, then prefix length, then target bytes) so tests and the
//! control plane see stable output.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Error type for route table mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("prefix is already present in the route table")]
    AlreadyPresent,
    #[error("prefix is not present in the route table")]
    NotPresent,
}

/// Error type for CIDR text parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed CIDR prefix")]
pub struct PrefixParseError;

// ============================================================================
// Prefix
// ============================================================================

/// A canonical (masked) IP network prefix.
///
/// The address is always the network address: host bits are cleared on
/// construction, so `10.42.3.4/16` and `10.42.0.0/16` are the same value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, PrefixParseError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(PrefixParseError);
        }
        let masked = mask_addr(addr, len);
        Ok(Self { addr: masked, len })
    }

    /// Host route for a single address (`/32` or `/128`).
    pub fn host(addr: IpAddr) -> Self {
        let len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Whether `ip` falls inside this prefix. Always false across families.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_addr(ip, self.len) == self.addr
            }
            _ => false,
        }
    }

    /// Whether `other` is entirely contained within this prefix.
    pub fn contains_prefix(&self, other: &Prefix) -> bool {
        other.len >= self.len && self.contains(other.addr)
    }

    /// The address as a left-aligned 128-bit key for trie traversal.
    /// IPv4 addresses occupy the top 32 bits.
    fn key_bits(&self) -> u128 {
        addr_key_bits(self.addr)
    }
}

fn addr_key_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => (u32::from(v4) as u128) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn mask_addr(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = if len == 0 { 0 } else { bits & (u32::MAX << (32 - len as u32)) };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = if len == 0 { 0 } else { bits & (u128::MAX << (128 - len as u32)) };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

impl FromStr for Prefix {
    type Err = PrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, len_part) = s.split_once('/').ok_or(PrefixParseError)?;
        let addr: IpAddr = addr_part.parse().map_err(|_| PrefixParseError)?;
        let len: u8 = len_part.parse().map_err(|_| PrefixParseError)?;
        Self::new(addr, len)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({self})")
    }
}

impl TryFrom<String> for Prefix {
    type Error = PrefixParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Prefix> for String {
    fn from(p: Prefix) -> Self {
        p.to_string()
    }
}

// ============================================================================
// Route entries
// ============================================================================

/// A binding of a prefix to the peer that owns it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: Prefix,
    pub target: NodeId,
}

// ============================================================================
// Binary prefix trie (single family)
// ============================================================================

#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    entry: Option<RouteEntry>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.entry.is_none() && self.children[0].is_none() && self.children[1].is_none()
    }
}

/// Prefix trie for one address family. Keys are left-aligned 128-bit values;
/// only the top `len` bits of a prefix participate in traversal.
struct PrefixTrie {
    root: TrieNode,
    entries: usize,
}

#[inline]
fn bit_at(key: u128, depth: u8) -> usize {
    ((key >> (127 - depth as u32)) & 1) as usize
}

impl PrefixTrie {
    fn new() -> Self {
        Self { root: TrieNode::default(), entries: 0 }
    }

    fn insert(&mut self, entry: RouteEntry) -> Result<(), RouteError> {
        let key = entry.prefix.key_bits();
        let mut node = &mut self.root;
        for depth in 0..entry.prefix.prefix_len() {
            node = &mut **node.children[bit_at(key, depth)].get_or_insert_with(Default::default);
        }
        if node.entry.is_some() {
            return Err(RouteError::AlreadyPresent);
        }
        node.entry = Some(entry);
        self.entries += 1;
        Ok(())
    }

    fn remove(&mut self, prefix: &Prefix) -> Result<RouteEntry, RouteError> {
        let key = prefix.key_bits();
        let removed = Self::remove_rec(&mut self.root, key, 0, prefix.prefix_len())?;
        self.entries -= 1;
        Ok(removed)
    }

    /// Recursive removal that prunes branches left empty behind it.
    fn remove_rec(
        node: &mut TrieNode,
        key: u128,
        depth: u8,
        len: u8,
    ) -> Result<RouteEntry, RouteError> {
        if depth == len {
            return node.entry.take().ok_or(RouteError::NotPresent);
        }
        let slot = bit_at(key, depth);
        let child = node.children[slot].as_mut().ok_or(RouteError::NotPresent)?;
        let removed = Self::remove_rec(child, key, depth + 1, len)?;
        if child.is_empty() {
            node.children[slot] = None;
        }
        Ok(removed)
    }

    fn lookup_longest(&self, ip: IpAddr) -> Option<RouteEntry> {
        let key = addr_key_bits(ip);
        let mut node = &self.root;
        let mut best = node.entry;
        for depth in 0..128u8 {
            match node.children[bit_at(key, depth)].as_deref() {
                Some(child) => {
                    node = child;
                    if node.entry.is_some() {
                        best = node.entry;
                    }
                }
                None => break,
            }
        }
        best
    }

    fn contains(&self, prefix: &Prefix) -> bool {
        let key = prefix.key_bits();
        let mut node = &self.root;
        for depth in 0..prefix.prefix_len() {
            match node.children[bit_at(key, depth)].as_deref() {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.entry.is_some()
    }

    fn collect_covered(&self, query: &Prefix, out: &mut Vec<RouteEntry>) {
        let key = query.key_bits();
        let mut node = &self.root;
        for depth in 0..query.prefix_len() {
            match node.children[bit_at(key, depth)].as_deref() {
                Some(child) => node = child,
                None => return,
            }
        }
        Self::collect_subtree(node, out);
    }

    fn collect_subtree(node: &TrieNode, out: &mut Vec<RouteEntry>) {
        if let Some(entry) = node.entry {
            out.push(entry);
        }
        for child in node.children.iter().flatten() {
            Self::collect_subtree(child, out);
        }
    }
}

// ============================================================================
// RouteTable
// ============================================================================

/// Longest-prefix-match route table over both address families.
pub struct RouteTable {
    v4: PrefixTrie,
    v6: PrefixTrie,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { v4: PrefixTrie::new(), v6: PrefixTrie::new() }
    }

    fn trie_for(&self, prefix: &Prefix) -> &PrefixTrie {
        if prefix.is_v4() { &self.v4 } else { &self.v6 }
    }

    fn trie_for_mut(&mut self, prefix: &Prefix) -> &mut PrefixTrie {
        if prefix.is_v4() { &mut self.v4 } else { &mut self.v6 }
    }

    /// Add an entry. Duplicate detection is on the prefix alone.
    pub fn insert(&mut self, prefix: Prefix, target: NodeId) -> Result<(), RouteError> {
        self.trie_for_mut(&prefix).insert(RouteEntry { prefix, target })
    }

    pub fn remove(&mut self, prefix: &Prefix) -> Result<RouteEntry, RouteError> {
        self.trie_for_mut(prefix).remove(prefix)
    }

    pub fn contains(&self, prefix: &Prefix) -> bool {
        self.trie_for(prefix).contains(prefix)
    }

    /// The entry with the longest prefix containing `ip`, if any.
    pub fn lookup_longest(&self, ip: IpAddr) -> Option<RouteEntry> {
        match ip {
            IpAddr::V4(_) => self.v4.lookup_longest(ip),
            IpAddr::V6(_) => self.v6.lookup_longest(ip),
        }
    }

    /// All entries whose prefix is contained within `query`, unordered.
    pub fn lookup_covered(&self, query: &Prefix) -> Vec<RouteEntry> {
        let mut out = Vec::new();
        self.trie_for(query).collect_covered(query, &mut out);
        out
    }

    /// Deterministically ordered snapshot of every entry, v4 first.
    pub fn list_all(&self) -> Vec<RouteEntry> {
        let mut out = Vec::with_capacity(self.len());
        PrefixTrie::collect_subtree(&self.v4.root, &mut out);
        let v4_count = out.len();
        PrefixTrie::collect_subtree(&self.v6.root, &mut out);
        out[..v4_count].sort_by(entry_order);
        out[v4_count..].sort_by(entry_order);
        out
    }

    pub fn len(&self) -> usize {
        self.v4.entries + self.v6.entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_order(a: &RouteEntry, b: &RouteEntry) -> std::cmp::Ordering {
    a.prefix
        .addr()
        .cmp(&b.prefix.addr())
        .then(a.prefix.prefix_len().cmp(&b.prefix.prefix_len()))
        .then(a.target.as_bytes().cmp(b.target.as_bytes()))
}
