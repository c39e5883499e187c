//! # Supervisor
//!
//! The supervisor wires the daemon together: it owns the shared network
//! state, brings up the virtual interface, starts the discovery loop and the
//! forwarder pumps, and serializes every control-plane mutation.
//!
//! Mutations follow one discipline: validate against current state, apply to
//! the in-memory tables, apply to the kernel via the interface, and roll the
//! in-memory change back if the kernel refuses (and vice versa for removal),
//! so the two views never diverge. The write lock is held across the whole
//! sequence; readers see either the old pair or the new pair, never a
//! half-applied one.
//!
//! Shutdown is bounded: tasks get five seconds to drain after the shutdown
//! signal, then they are aborted.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{insert_host_routes, Config, Shared};
use crate::device::TunDevice;
use crate::discovery::Discovery;
use crate::forwarder::{self, ForwarderCounters, INJECT_CHANNEL_SIZE};
use crate::identity::{NodeId, OVERLAY_PREFIX4_LEN, OVERLAY_PREFIX6_LEN};
use crate::peers::{Peer, RefError, RegistryError};
use crate::routes::Prefix;
use crate::transport::Underlay;

/// How long tasks get to drain after the shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Error surface of the control plane, returned to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("peer name cannot be empty")]
    EmptyName,
    #[error("peer id cannot be empty")]
    EmptyId,
    #[error("malformed peer id")]
    BadId,
    #[error("a peer with this id already exists")]
    DuplicateId,
    #[error("a peer with this name already exists")]
    DuplicateName,
    #[error("malformed prefix")]
    BadPrefix,
    #[error("no such peer")]
    NoSuchPeer,
    #[error("peer reference is ambiguous")]
    AmbiguousPeer,
    #[error("prefix is already routed")]
    DuplicatePrefix,
    #[error("prefix is not routed")]
    NotPresent,
    #[error("interface rejected the change: {0}")]
    Interface(String),
}

impl ControlError {
    /// Stable machine-readable code for the RPC layer.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::EmptyName => "EmptyName",
            ControlError::EmptyId => "EmptyId",
            ControlError::BadId => "BadId",
            ControlError::DuplicateId => "DuplicateId",
            ControlError::DuplicateName => "DuplicateName",
            ControlError::BadPrefix => "BadPrefix",
            ControlError::NoSuchPeer => "NoSuchPeer",
            ControlError::AmbiguousPeer => "Ambiguous",
            ControlError::DuplicatePrefix => "DuplicatePrefix",
            ControlError::NotPresent => "NotPresent",
            ControlError::Interface(_) => "Interface",
        }
    }
}

impl From<RefError> for ControlError {
    fn from(e: RefError) -> Self {
        match e {
            RefError::NotFound => ControlError::NoSuchPeer,
            RefError::Ambiguous => ControlError::AmbiguousPeer,
        }
    }
}

// ============================================================================
// Control-plane views
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub self_id: String,
    pub addr4: String,
    pub addr6: String,
    pub peer_count: usize,
    pub connected_peers: usize,
    pub connection_count: usize,
    pub listen_addrs: Vec<String>,
    /// One line per connected peer: `@name addr /node/<id>`.
    pub peer_addrs: Vec<String>,
    pub packets_forwarded: u64,
    pub packets_injected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: Option<String>,
    pub v4: String,
    pub v6: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub prefix: String,
    pub target_name: Option<String>,
    pub target_id: String,
    pub is_connected: bool,
    pub is_relay: bool,
    pub relay_id: Option<String>,
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    interface: String,
    self_id: NodeId,
    self_addr4: Ipv4Addr,
    self_addr6: Ipv6Addr,
    services: HashMap<String, String>,
    state: Shared,
    underlay: Arc<dyn Underlay>,
    device: Arc<dyn TunDevice>,
    counters: Arc<ForwarderCounters>,
    rediscover: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        underlay: Arc<dyn Underlay>,
        device: Arc<dyn TunDevice>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            interface: config.interface.clone(),
            self_id: config.self_id,
            self_addr4: config.self_addr4,
            self_addr6: config.self_addr6,
            services: config.services.clone(),
            state: config.state.clone(),
            underlay,
            device,
            counters: Arc::new(ForwarderCounters::default()),
            rediscover: Arc::new(Notify::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn services(&self) -> &HashMap<String, String> {
        &self.services
    }

    /// Assign interface addresses, install boot-time routes, start all tasks.
    pub async fn start(&self) -> Result<()> {
        self.device
            .set_addresses(&[
                format!("{}/{}", self.self_addr4, OVERLAY_PREFIX4_LEN),
                format!("{}/{}", self.self_addr6, OVERLAY_PREFIX6_LEN),
            ])
            .await
            .context("failed to assign interface addresses")?;

        let boot_routes: Vec<Prefix> = {
            let state = self.state.read().await;
            state.table.list_all().iter().map(|e| e.prefix).collect()
        };
        for prefix in &boot_routes {
            self.device
                .add_route(prefix)
                .await
                .with_context(|| format!("failed to install boot route {prefix}"))?;
        }

        let shutdown = self.shutdown.subscribe();
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_CHANNEL_SIZE);
        let acceptor = self.underlay.accept_streams(crate::transport::PACKET_PROTOCOL);

        let discovery = Discovery::new(
            self.underlay.clone(),
            self.state.clone(),
            self.rediscover.clone(),
            shutdown.clone(),
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(discovery.run()));
        tasks.push(tokio::spawn(forwarder::egress_pump(
            self.device.clone(),
            self.underlay.clone(),
            self.state.clone(),
            self.counters.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(forwarder::ingress_pump(
            acceptor,
            inject_tx,
            self.counters.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(forwarder::device_writer(
            self.device.clone(),
            inject_rx,
            self.counters.clone(),
            shutdown,
        )));

        info!(
            interface = %self.interface,
            node = %self.self_id,
            v4 = %self.self_addr4,
            v6 = %self.self_addr6,
            "overlay up"
        );
        Ok(())
    }

    /// Wake the discovery loop immediately. Pending signals coalesce.
    pub fn rediscover(&self) {
        self.rediscover.notify_one();
    }

    /// A receiver that observes the daemon-wide shutdown signal.
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal shutdown and wait (bounded) for tasks to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!("task did not stop within grace period, aborting");
                task.abort();
            }
        }
        info!("overlay down");
    }

    // ------------------------------------------------------------------
    // Read-only control plane
    // ------------------------------------------------------------------

    pub async fn status(&self) -> StatusReport {
        let state = self.state.read().await;
        let mut connected_peers = 0;
        let mut peer_addrs = Vec::new();
        for peer in state.registry.list() {
            if self.underlay.connectedness(peer.id) {
                connected_peers += 1;
                let name = peer.name.as_deref().unwrap_or("");
                for addr in self.underlay.connected_addrs(peer.id) {
                    peer_addrs.push(format!("@{name} {addr} /node/{}", peer.id));
                }
            }
        }

        StatusReport {
            self_id: self.self_id.to_base36(),
            addr4: self.self_addr4.to_string(),
            addr6: self.self_addr6.to_string(),
            peer_count: state.registry.len(),
            connected_peers,
            connection_count: self.underlay.connection_count(),
            listen_addrs: self.underlay.listen_addrs(),
            peer_addrs,
            packets_forwarded: self
                .counters
                .forwarded
                .load(std::sync::atomic::Ordering::Relaxed),
            packets_injected: self
                .counters
                .injected
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        let state = self.state.read().await;
        state
            .registry
            .list()
            .iter()
            .map(|peer| PeerInfo {
                id: peer.id.to_base36(),
                name: peer.name.clone(),
                v4: peer.addr4.to_string(),
                v6: peer.addr6.to_string(),
            })
            .collect()
    }

    pub async fn list_routes(&self) -> Vec<RouteInfo> {
        let state = self.state.read().await;
        let mut entries = state.table.lookup_covered(&all_v4());
        entries.extend(state.table.lookup_covered(&all_v6()));

        entries
            .iter()
            .map(|entry| {
                let link = self.underlay.link_info(entry.target);
                RouteInfo {
                    prefix: entry.prefix.to_string(),
                    target_name: state
                        .registry
                        .find_by_id(&entry.target)
                        .and_then(|p| p.name.clone()),
                    target_id: entry.target.to_base36(),
                    is_connected: self.underlay.connectedness(entry.target),
                    is_relay: link.map(|l| l.is_relay).unwrap_or(false),
                    relay_id: link.and_then(|l| l.relay).map(|id| id.to_base36()),
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn add_route(&self, prefix: &str, cli_ref: &str) -> Result<(), ControlError> {
        let prefix: Prefix = prefix.parse().map_err(|_| ControlError::BadPrefix)?;

        let mut state = self.state.write().await;
        let target = state.registry.find_by_cli_ref(cli_ref)?.id;

        state
            .table
            .insert(prefix, target)
            .map_err(|_| ControlError::DuplicatePrefix)?;
        if let Err(e) = self.device.add_route(&prefix).await {
            let _ = state.table.remove(&prefix);
            return Err(ControlError::Interface(e.to_string()));
        }

        info!(route = %prefix, peer = %target, "route added");
        Ok(())
    }

    pub async fn remove_route(&self, prefix: &str) -> Result<(), ControlError> {
        let prefix: Prefix = prefix.parse().map_err(|_| ControlError::BadPrefix)?;

        let mut state = self.state.write().await;
        if !state.table.contains(&prefix) {
            return Err(ControlError::NotPresent);
        }
        if let Err(e) = self.device.remove_route(&prefix).await {
            return Err(ControlError::Interface(e.to_string()));
        }
        if state.table.remove(&prefix).is_err() {
            // Keep the kernel and the table in agreement.
            let _ = self.device.add_route(&prefix).await;
            return Err(ControlError::NotPresent);
        }

        info!(route = %prefix, "route removed");
        Ok(())
    }

    pub async fn add_peer(&self, name: &str, id_text: &str) -> Result<(), ControlError> {
        if name.is_empty() {
            return Err(ControlError::EmptyName);
        }
        if id_text.is_empty() {
            return Err(ControlError::EmptyId);
        }
        let id = NodeId::parse(id_text).map_err(|_| ControlError::BadId)?;
        let peer = Peer::new(id, Some(name.to_string()));
        let host4 = Prefix::host(peer.addr4.into());
        let host6 = Prefix::host(peer.addr6.into());

        {
            let mut state = self.state.write().await;
            state.registry.add(peer.clone()).map_err(|e| match e {
                RegistryError::DuplicateId => ControlError::DuplicateId,
                RegistryError::DuplicateName => ControlError::DuplicateName,
            })?;
            if insert_host_routes(&mut state.table, &peer).is_err() {
                state.registry.remove_by_id(&id);
                return Err(ControlError::DuplicatePrefix);
            }

            if let Err(e) = self.device.add_route(&host4).await {
                Self::unwind_peer(&mut state, &id, &host4, &host6);
                return Err(ControlError::Interface(e.to_string()));
            }
            if let Err(e) = self.device.add_route(&host6).await {
                let _ = self.device.remove_route(&host4).await;
                Self::unwind_peer(&mut state, &id, &host4, &host6);
                return Err(ControlError::Interface(e.to_string()));
            }
        }

        info!(peer = %id, name = %name, v4 = %peer.addr4, v6 = %peer.addr6, "peer added");
        self.rediscover();
        Ok(())
    }

    fn unwind_peer(
        state: &mut crate::config::NetState,
        id: &NodeId,
        host4: &Prefix,
        host6: &Prefix,
    ) {
        let _ = state.table.remove(host4);
        let _ = state.table.remove(host6);
        state.registry.remove_by_id(id);
    }

    pub async fn remove_peer(&self, cli_ref: &str) -> Result<(), ControlError> {
        let mut state = self.state.write().await;
        let peer_id = state.registry.find_by_cli_ref(cli_ref)?.id;

        // Dependent routes follow their peer: implicit host routes and every
        // explicit entry targeting it.
        let mut owned: Vec<Prefix> = state
            .table
            .lookup_covered(&all_v4())
            .into_iter()
            .chain(state.table.lookup_covered(&all_v6()))
            .filter(|entry| entry.target == peer_id)
            .map(|entry| entry.prefix)
            .collect();
        owned.sort();

        for prefix in &owned {
            let _ = state.table.remove(prefix);
            if let Err(e) = self.device.remove_route(prefix).await {
                warn!(route = %prefix, error = %e, "failed to remove interface route");
            }
        }
        state.registry.remove_by_id(&peer_id);

        info!(peer = %peer_id, routes = owned.len(), "peer removed");
        Ok(())
    }
}

fn all_v4() -> Prefix {
    "0.0.0.0/0".parse().expect("static prefix")
}

fn all_v6() -> Prefix {
    "::/0".parse().expect("static prefix")
}
