//! # Configuration
//!
//! The daemon loads a single JSON configuration file at start:
//!
//! ```json
//! {
//!   "listenAddresses": ["0.0.0.0:8488"],
//!   "privateKey": "f<hex>",
//!   "peers": [
//!     {
//!       "id": "k...",
//!       "name": "alice",
//!       "addrs": ["203.0.113.7:8488"],
//!       "routes": [{ "net": "10.42.0.0/16" }]
//!     }
//!   ],
//!   "services": { "www": "127.0.0.1:8080" }
//! }
//! ```
//!
//! The private key is multibase-prefixed: `f`/`F` for hex, `m` for unpadded
//! base64, covering the 32-byte Ed25519 secret (a 64-byte secret‖public
//! concatenation is accepted; the first 32 bytes are used).
//!
//! Loading derives the node's own identity and overlay addresses, builds the
//! peer registry and route table (each peer's explicit routes plus the two
//! implicit host routes for its derived addresses), and seeds the underlay
//! address book from the optional per-peer `addrs` list. Duplicate ids, names,
//! and prefixes are load-time errors.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::identity::{derive_v4, derive_v6, Keypair, NodeId};
use crate::peers::{Peer, PeerRegistry};
use crate::routes::{Prefix, RouteTable};

// ============================================================================
// On-disk schema
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    listen_addresses: Vec<String>,
    private_key: String,
    #[serde(default)]
    peers: Vec<PeerSchema>,
    #[serde(default)]
    services: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PeerSchema {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    addrs: Vec<String>,
    #[serde(default)]
    routes: Vec<RouteSchema>,
}

#[derive(Debug, Deserialize)]
struct RouteSchema {
    net: String,
}

// ============================================================================
// Runtime configuration
// ============================================================================

/// Registry and route table under one lock, so control-plane mutations touch
/// both atomically and readers see a consistent pair.
pub struct NetState {
    pub registry: PeerRegistry,
    pub table: RouteTable,
}

/// Shared handle to the mutable network state. Readers (forwarder, gate,
/// discovery, DNS) take the read side; only the supervisor writes.
pub type Shared = Arc<RwLock<NetState>>;

/// Everything the daemon knows at boot.
pub struct Config {
    pub interface: String,
    pub listen_addresses: Vec<SocketAddr>,
    pub keypair: Keypair,
    pub self_id: NodeId,
    pub self_addr4: Ipv4Addr,
    pub self_addr6: Ipv6Addr,
    pub state: Shared,
    /// Initial underlay addresses per peer, from `peers[].addrs`.
    pub address_book: HashMap<NodeId, Vec<SocketAddr>>,
    /// Service name → underlay address, served verbatim to the DNS responder.
    pub services: HashMap<String, String>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path, interface: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: ConfigFile =
            serde_json::from_str(&raw).context("failed to parse config file")?;

        let keypair = decode_private_key(&file.private_key)?;
        let self_id = keypair.node_id();

        let mut listen_addresses = Vec::with_capacity(file.listen_addresses.len());
        for addr in &file.listen_addresses {
            listen_addresses.push(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid listen address {addr}"))?,
            );
        }

        let mut registry = PeerRegistry::new();
        let mut table = RouteTable::new();
        let mut address_book: HashMap<NodeId, Vec<SocketAddr>> = HashMap::new();

        for entry in &file.peers {
            let id = NodeId::parse(&entry.id)
                .with_context(|| format!("invalid peer id {}", entry.id))?;
            if id == self_id {
                bail!("config lists the node's own id as a peer");
            }
            let peer = Peer::new(id, entry.name.clone());

            for route in &entry.routes {
                let prefix: Prefix = route
                    .net
                    .parse()
                    .with_context(|| format!("invalid route {}", route.net))?;
                table
                    .insert(prefix, id)
                    .with_context(|| format!("route {prefix} already present"))?;
                info!(route = %prefix, peer = %id, "configured route");
            }
            insert_host_routes(&mut table, &peer)
                .with_context(|| format!("host routes for {} collide", id))?;

            if !entry.addrs.is_empty() {
                let mut addrs = Vec::with_capacity(entry.addrs.len());
                for addr in &entry.addrs {
                    addrs.push(
                        addr.parse::<SocketAddr>()
                            .with_context(|| format!("invalid peer address {addr}"))?,
                    );
                }
                address_book.insert(id, addrs);
            }

            registry
                .add(peer)
                .with_context(|| format!("peer {} rejected", entry.id))?;
        }

        Ok(Self {
            interface: interface.to_string(),
            listen_addresses,
            self_addr4: derive_v4(&self_id),
            self_addr6: derive_v6(&self_id),
            keypair,
            self_id,
            state: Arc::new(RwLock::new(NetState { registry, table })),
            address_book,
            services: file.services,
        })
    }
}

/// Insert the two implicit host routes for a peer's derived addresses.
pub fn insert_host_routes(table: &mut RouteTable, peer: &Peer) -> Result<(), crate::routes::RouteError> {
    table.insert(Prefix::host(peer.addr4.into()), peer.id)?;
    if let Err(e) = table.insert(Prefix::host(peer.addr6.into()), peer.id) {
        let _ = table.remove(&Prefix::host(peer.addr4.into()));
        return Err(e);
    }
    Ok(())
}

fn decode_private_key(encoded: &str) -> Result<Keypair> {
    let mut chars = encoded.chars();
    let prefix = chars.next().context("private key is empty")?;
    let body = chars.as_str();

    let bytes = match prefix {
        'f' | 'F' => hex::decode(body).context("private key is not valid hex")?,
        'm' => base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(body)
            .context("private key is not valid base64")?,
        other => bail!("unsupported multibase prefix {other:?} for private key"),
    };

    let secret: [u8; 32] = match bytes.len() {
        32 => bytes.try_into().unwrap(),
        64 => bytes[..32].try_into().unwrap(),
        n => bail!("private key must be 32 or 64 bytes, got {n}"),
    };
    Ok(Keypair::from_secret_key_bytes(&secret))
}
