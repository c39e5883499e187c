//! # Underlay Transport
//!
//! The overlay sees its transport as an oriented graph of authenticated
//! links: dial a node id, open a tagged stream to it, accept tagged streams
//! from anyone, ask who is connected. The [`Underlay`] trait captures exactly
//! that surface so the forwarder, discovery loop, and supervisor never touch
//! sockets, and tests can substitute a loopback implementation.
//!
//! [`QuicUnderlay`] is the production implementation: one QUIC endpoint with
//! mutual-TLS Ed25519 identity certificates (see [`crate::crypto`]). Peer
//! addresses come from an address book seeded by configuration and extended
//! with the observed remote address of every identity-verified inbound
//! connection. Outbound dials are checked against the [`DialGate`] first, so
//! the underlay can never tunnel into the overlay it serves.
//!
//! ## Stream tagging
//!
//! A stream's opener writes a one-byte length and a protocol tag before any
//! payload. The acceptor reads the tag and hands the stream to whichever
//! component registered for it. Unknown tags close the stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock, Weak};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::crypto::{
    client_config, generate_node_cert, node_id_to_sni, server_config, verified_node_id,
};
use crate::gate::DialGate;
use crate::identity::{Keypair, NodeId};
use crate::streams::PacketStream;

/// Protocol tag of the overlay packet plane.
pub const PACKET_PROTOCOL: &str = "skein/packets/1";

/// Longest protocol tag an acceptor will read.
const MAX_PROTOCOL_TAG: usize = 64;

/// Capacity of each registered acceptor channel.
const ACCEPTOR_CHANNEL_SIZE: usize = 64;

/// Bound on the connection cache; least-recently-seen entries are evicted
/// so an address-book full of strangers cannot grow state without limit.
const MAX_CACHED_CONNECTIONS: usize = 1024;

/// How a peer is currently reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub is_relay: bool,
    pub relay: Option<NodeId>,
}

// ============================================================================
// Underlay trait
// ============================================================================

/// The transport surface the overlay is built on.
#[async_trait]
pub trait Underlay: Send + Sync + 'static {
    /// This node's identity.
    fn self_id(&self) -> NodeId;

    /// Try to establish a connection to `peer`. Idempotent when connected.
    async fn dial(&self, peer: NodeId) -> Result<()>;

    /// Open an outbound stream to `peer` tagged with `protocol`, dialing
    /// first if necessary.
    async fn open_stream(&self, peer: NodeId, protocol: &str) -> Result<PacketStream>;

    /// Register for inbound streams tagged with `protocol`. Streams arriving
    /// for a tag nobody registered are closed.
    fn accept_streams(&self, protocol: &str) -> mpsc::Receiver<(NodeId, PacketStream)>;

    /// Whether a live connection to `peer` exists right now.
    fn connectedness(&self, peer: NodeId) -> bool;

    /// Total live connections, including peers outside the registry.
    fn connection_count(&self) -> usize;

    fn listen_addrs(&self) -> Vec<String>;

    /// Remote addresses of the live connection to `peer`, for diagnostics.
    fn connected_addrs(&self, peer: NodeId) -> Vec<String>;

    fn link_info(&self, peer: NodeId) -> Option<LinkInfo>;

    /// Re-seed connectivity from scratch; called when fully isolated.
    async fn bootstrap(&self);

    /// Drop dead state so the next reconciliation sees the truth.
    async fn refresh_routing_table(&self);
}

// ============================================================================
// QUIC implementation
// ============================================================================

pub struct QuicUnderlay {
    endpoint: quinn::Endpoint,
    client: quinn::ClientConfig,
    self_id: NodeId,
    connections: RwLock<LruCache<NodeId, quinn::Connection>>,
    address_book: RwLock<HashMap<NodeId, Vec<SocketAddr>>>,
    acceptors: RwLock<HashMap<String, mpsc::Sender<(NodeId, PacketStream)>>>,
    gate: DialGate,
    /// Back-reference for tasks spawned from `&self` methods.
    self_ref: Weak<QuicUnderlay>,
}

impl QuicUnderlay {
    /// Bind the endpoint and start accepting connections.
    ///
    /// Only the first listen address is bound; QUIC multiplexes everything
    /// over the one socket.
    pub async fn bind(
        keypair: &Keypair,
        listen: &[SocketAddr],
        address_book: HashMap<NodeId, Vec<SocketAddr>>,
        gate: DialGate,
    ) -> Result<Arc<Self>> {
        let bind_addr = listen
            .first()
            .copied()
            .unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr"));
        if listen.len() > 1 {
            warn!(addr = %bind_addr, "multiple listen addresses configured, binding the first");
        }

        let (certs, key) = generate_node_cert(keypair)?;
        let (client_certs, client_key) = generate_node_cert(keypair)?;
        let server = server_config(certs, key)?;
        let client = client_config(client_certs, client_key)?;

        let endpoint = quinn::Endpoint::server(server, bind_addr)
            .with_context(|| format!("failed to bind underlay endpoint on {bind_addr}"))?;
        info!(addr = %endpoint.local_addr()?, "underlay endpoint listening");

        let cache_cap = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("cap is non-zero");
        let underlay = Arc::new_cyclic(|self_ref| Self {
            endpoint,
            client,
            self_id: keypair.node_id(),
            connections: RwLock::new(LruCache::new(cache_cap)),
            address_book: RwLock::new(address_book),
            acceptors: RwLock::new(HashMap::new()),
            gate,
            self_ref: self_ref.clone(),
        });

        tokio::spawn(Self::accept_loop(underlay.clone()));
        Ok(underlay)
    }

    async fn accept_loop(self: Arc<Self>) {
        while let Some(incoming) = self.endpoint.accept().await {
            let underlay = self.clone();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(c) => c,
                    Err(e) => {
                        trace!(error = %e, "inbound handshake failed");
                        return;
                    }
                };
                let Some(peer) = verified_node_id(&connection) else {
                    debug!(remote = %connection.remote_address(), "inbound connection without usable identity");
                    connection.close(1u32.into(), b"identity required");
                    return;
                };
                debug!(peer = %peer, remote = %connection.remote_address(), "inbound connection");
                underlay.learn_address(peer, connection.remote_address());
                underlay.adopt_connection(peer, connection);
            });
        }
    }

    /// Record a live connection and start demultiplexing its streams.
    fn adopt_connection(&self, peer: NodeId, connection: quinn::Connection) {
        self.connections.write().expect("lock").put(peer, connection.clone());
        if let Some(underlay) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                underlay.demux_streams(peer, connection).await;
            });
        }
    }

    async fn demux_streams(&self, peer: NodeId, connection: quinn::Connection) {
        loop {
            let (send, mut recv) = match connection.accept_bi().await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(peer = %peer, reason = %e, "connection stopped accepting streams");
                    break;
                }
            };

            let tag = match read_protocol_tag(&mut recv).await {
                Ok(tag) => tag,
                Err(e) => {
                    trace!(peer = %peer, error = %e, "dropping stream with unreadable tag");
                    continue;
                }
            };

            let sender = self.acceptors.read().expect("lock").get(&tag).cloned();
            match sender {
                Some(sender) => {
                    let stream = PacketStream::new(Box::new(recv), Box::new(send));
                    if sender.send((peer, stream)).await.is_err() {
                        debug!(protocol = %tag, "acceptor gone, closing stream");
                    }
                }
                None => {
                    trace!(peer = %peer, protocol = %tag, "no acceptor for stream tag");
                }
            }
        }

        // The connection is dead; forget it if it is still the one on record.
        let mut connections = self.connections.write().expect("lock");
        if let Some(current) = connections.peek(&peer) {
            if current.stable_id() == connection.stable_id() {
                connections.pop(&peer);
            }
        }
    }

    fn learn_address(&self, peer: NodeId, addr: SocketAddr) {
        let mut book = self.address_book.write().expect("lock");
        let addrs = book.entry(peer).or_default();
        if !addrs.contains(&addr) {
            addrs.insert(0, addr);
        }
    }

    fn live_connection(&self, peer: NodeId) -> Option<quinn::Connection> {
        let connections = self.connections.read().expect("lock");
        connections
            .peek(&peer)
            .filter(|c| c.close_reason().is_none())
            .cloned()
    }
}

async fn read_protocol_tag(recv: &mut quinn::RecvStream) -> Result<String> {
    let len = recv.read_u8().await.context("stream closed before tag")? as usize;
    if len == 0 || len > MAX_PROTOCOL_TAG {
        bail!("protocol tag length {len} out of range");
    }
    let mut tag = vec![0u8; len];
    recv.read_exact(&mut tag).await.context("stream closed mid-tag")?;
    String::from_utf8(tag).context("protocol tag is not UTF-8")
}

async fn write_protocol_tag(send: &mut quinn::SendStream, protocol: &str) -> Result<()> {
    let tag = protocol.as_bytes();
    if tag.is_empty() || tag.len() > MAX_PROTOCOL_TAG {
        bail!("protocol tag length {} out of range", tag.len());
    }
    send.write_all(&[tag.len() as u8]).await?;
    send.write_all(tag).await?;
    Ok(())
}

#[async_trait]
impl Underlay for QuicUnderlay {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    async fn dial(&self, peer: NodeId) -> Result<()> {
        if self.connectedness(peer) {
            return Ok(());
        }

        let addrs = self
            .address_book
            .read()
            .expect("lock")
            .get(&peer)
            .cloned()
            .unwrap_or_default();
        if addrs.is_empty() {
            bail!("no known underlay addresses for {peer}");
        }

        let sni = node_id_to_sni(&peer);
        let mut last_error = None;
        for addr in addrs {
            if !self.gate.allow_underlay_dial(peer, addr).await {
                debug!(peer = %peer, addr = %addr, "dial vetoed: address is overlay-routed elsewhere");
                continue;
            }
            let connecting = match self.endpoint.connect_with(self.client.clone(), addr, &sni) {
                Ok(c) => c,
                Err(e) => {
                    last_error = Some(anyhow::Error::from(e));
                    continue;
                }
            };
            match connecting.await {
                Ok(connection) => {
                    debug!(peer = %peer, addr = %addr, "dialed peer");
                    // The TLS verifier already bound the certificate to the
                    // SNI id, so the identity needs no re-check here.
                    self.adopt_connection(peer, connection);
                    return Ok(());
                }
                Err(e) => {
                    trace!(peer = %peer, addr = %addr, error = %e, "dial attempt failed");
                    last_error = Some(anyhow::Error::from(e));
                }
            }
        }

        match last_error {
            Some(e) => Err(e.context(format!("all dial attempts to {peer} failed"))),
            None => bail!("every address for {peer} was vetoed by the recursion gate"),
        }
    }

    async fn open_stream(&self, peer: NodeId, protocol: &str) -> Result<PacketStream> {
        if self.live_connection(peer).is_none() {
            self.dial(peer).await?;
        }
        let connection = self
            .live_connection(peer)
            .with_context(|| format!("no live connection to {peer}"))?;

        let (mut send, recv) = connection
            .open_bi()
            .await
            .with_context(|| format!("failed to open stream to {peer}"))?;
        write_protocol_tag(&mut send, protocol).await?;
        Ok(PacketStream::new(Box::new(recv), Box::new(send)))
    }

    fn accept_streams(&self, protocol: &str) -> mpsc::Receiver<(NodeId, PacketStream)> {
        let (tx, rx) = mpsc::channel(ACCEPTOR_CHANNEL_SIZE);
        self.acceptors
            .write()
            .expect("lock")
            .insert(protocol.to_string(), tx);
        rx
    }

    fn connectedness(&self, peer: NodeId) -> bool {
        self.live_connection(peer).is_some()
    }

    fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("lock")
            .iter()
            .filter(|(_, c)| c.close_reason().is_none())
            .count()
    }

    fn listen_addrs(&self) -> Vec<String> {
        match self.endpoint.local_addr() {
            Ok(addr) => vec![addr.to_string()],
            Err(_) => Vec::new(),
        }
    }

    fn connected_addrs(&self, peer: NodeId) -> Vec<String> {
        self.live_connection(peer)
            .map(|c| vec![c.remote_address().to_string()])
            .unwrap_or_default()
    }

    fn link_info(&self, peer: NodeId) -> Option<LinkInfo> {
        // QUIC paths are always direct; there is no relay tier here.
        self.live_connection(peer).map(|_| LinkInfo {
            is_relay: false,
            relay: None,
        })
    }

    async fn bootstrap(&self) {
        let peers: Vec<NodeId> = self.address_book.read().expect("lock").keys().copied().collect();
        debug!(peers = peers.len(), "bootstrapping underlay from address book");
        for peer in peers {
            if !self.connectedness(peer) {
                if let Err(e) = self.dial(peer).await {
                    trace!(peer = %peer, error = %e, "bootstrap dial failed");
                }
            }
        }
    }

    async fn refresh_routing_table(&self) {
        let mut connections = self.connections.write().expect("lock");
        let dead: Vec<NodeId> = connections
            .iter()
            .filter(|(_, c)| c.close_reason().is_some())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in dead {
            connections.pop(&peer);
            trace!(peer = %peer, "pruned dead connection");
        }
    }
}
