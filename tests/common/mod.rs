//! Shared harness for integration tests: an in-memory underlay that wires
//! nodes together over duplex pipes, plus configuration builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use skein::config::{insert_host_routes, Config, NetState};
use skein::identity::{derive_v4, derive_v6, Keypair, NodeId};
use skein::peers::{Peer, PeerRegistry};
use skein::routes::RouteTable;
use skein::streams::PacketStream;
use skein::transport::{LinkInfo, Underlay};

/// Deterministic keypair for a test seed.
pub fn keypair(seed: u8) -> Keypair {
    Keypair::from_secret_key_bytes(&[seed; 32])
}

pub fn node_id(seed: u8) -> NodeId {
    keypair(seed).node_id()
}

/// Build a runtime config without touching the filesystem.
pub fn make_config(kp: Keypair, peers: &[(NodeId, &str)]) -> Config {
    let self_id = kp.node_id();
    let mut registry = PeerRegistry::new();
    let mut table = RouteTable::new();
    for (id, name) in peers {
        let peer = Peer::new(*id, Some(name.to_string()));
        insert_host_routes(&mut table, &peer).expect("host routes");
        registry.add(peer).expect("test peer");
    }
    Config {
        interface: "skein-test".to_string(),
        listen_addresses: Vec::new(),
        self_addr4: derive_v4(&self_id),
        self_addr6: derive_v6(&self_id),
        keypair: kp,
        self_id,
        state: Arc::new(tokio::sync::RwLock::new(NetState { registry, table })),
        address_book: HashMap::new(),
        services: HashMap::new(),
    }
}

// ============================================================================
// Mock underlay
// ============================================================================

/// The "wire" between mock underlays: per-(node, protocol) acceptor channels.
#[derive(Default)]
pub struct MockNet {
    acceptors: Mutex<HashMap<(NodeId, String), mpsc::Sender<(NodeId, PacketStream)>>>,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A loopback underlay with scriptable connectedness and full call logging.
pub struct MockUnderlay {
    self_id: NodeId,
    net: Arc<MockNet>,
    connected: Mutex<HashSet<NodeId>>,
    /// When set, a dial immediately marks the peer connected.
    pub auto_connect: AtomicBool,
    pub dials: Mutex<Vec<(NodeId, Instant)>>,
    pub checks: Mutex<Vec<Instant>>,
    pub bootstraps: Mutex<Vec<Instant>>,
    pub streams_opened: AtomicUsize,
}

impl MockUnderlay {
    pub fn new(self_id: NodeId, net: Arc<MockNet>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            net,
            connected: Mutex::new(HashSet::new()),
            auto_connect: AtomicBool::new(true),
            dials: Mutex::new(Vec::new()),
            checks: Mutex::new(Vec::new()),
            bootstraps: Mutex::new(Vec::new()),
            streams_opened: AtomicUsize::new(0),
        })
    }

    pub fn set_connected(&self, peer: NodeId, connected: bool) {
        let mut set = self.connected.lock().unwrap();
        if connected {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn check_times(&self) -> Vec<Instant> {
        self.checks.lock().unwrap().clone()
    }
}

fn duplex_pair() -> (PacketStream, PacketStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (read_a, write_a) = tokio::io::split(a);
    let (read_b, write_b) = tokio::io::split(b);
    (
        PacketStream::new(Box::new(read_a), Box::new(write_a)),
        PacketStream::new(Box::new(read_b), Box::new(write_b)),
    )
}

#[async_trait]
impl Underlay for MockUnderlay {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    async fn dial(&self, peer: NodeId) -> Result<()> {
        self.dials.lock().unwrap().push((peer, Instant::now()));
        if self.auto_connect.load(Ordering::SeqCst) {
            self.connected.lock().unwrap().insert(peer);
            Ok(())
        } else {
            anyhow::bail!("mock dial refused")
        }
    }

    async fn open_stream(&self, peer: NodeId, protocol: &str) -> Result<PacketStream> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let sender = self
            .net
            .acceptors
            .lock()
            .unwrap()
            .get(&(peer, protocol.to_string()))
            .cloned()
            .context("peer is not accepting this protocol")?;
        let (local, remote) = duplex_pair();
        sender
            .send((self.self_id, remote))
            .await
            .map_err(|_| anyhow::anyhow!("peer acceptor closed"))?;
        Ok(local)
    }

    fn accept_streams(&self, protocol: &str) -> mpsc::Receiver<(NodeId, PacketStream)> {
        let (tx, rx) = mpsc::channel(64);
        self.net
            .acceptors
            .lock()
            .unwrap()
            .insert((self.self_id, protocol.to_string()), tx);
        rx
    }

    fn connectedness(&self, peer: NodeId) -> bool {
        self.checks.lock().unwrap().push(Instant::now());
        self.connected.lock().unwrap().contains(&peer)
    }

    fn connection_count(&self) -> usize {
        self.connected.lock().unwrap().len()
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec!["mock:0".to_string()]
    }

    fn connected_addrs(&self, peer: NodeId) -> Vec<String> {
        if self.connected.lock().unwrap().contains(&peer) {
            vec!["mock:1".to_string()]
        } else {
            Vec::new()
        }
    }

    fn link_info(&self, peer: NodeId) -> Option<LinkInfo> {
        self.connected.lock().unwrap().contains(&peer).then_some(LinkInfo {
            is_relay: false,
            relay: None,
        })
    }

    async fn bootstrap(&self) {
        self.bootstraps.lock().unwrap().push(Instant::now());
    }

    async fn refresh_routing_table(&self) {}
}
