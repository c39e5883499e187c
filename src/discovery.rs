//! # Peer Discovery Loop
//!
//! One cooperative task keeps the node connected to every configured peer.
//! Each pass reconciles the registry against observed connectedness: peers
//! without a live connection get a non-blocking dial whose outcome is logged,
//! never awaited by the loop itself.
//!
//! The pass interval adapts:
//!
//! - starts at 1 second
//! - doubles after every pass that sees at least one connected peer, capped
//!   at 60 seconds
//! - drops to 10 seconds when no peer is connected at all, after asking the
//!   underlay to bootstrap and refresh itself
//! - an explicit rediscover signal forces an immediate pass (1 ms) and
//!   resets the base interval to 3 seconds
//!
//! The rediscover signal is edge-triggered and coalescing: any number of
//! pending signals collapse into one immediate pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::config::Shared;
use crate::identity::NodeId;
use crate::transport::Underlay;

/// First pass runs one second after boot.
pub const INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Base interval after an explicit rediscover signal.
pub const REDISCOVER_INTERVAL: Duration = Duration::from_secs(3);

/// Interval while fully isolated (bootstrap branch).
pub const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff ceiling.
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

pub struct Discovery {
    underlay: Arc<dyn Underlay>,
    state: Shared,
    rediscover: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl Discovery {
    pub fn new(
        underlay: Arc<dyn Underlay>,
        state: Shared,
        rediscover: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            underlay,
            state,
            rediscover,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = INITIAL_INTERVAL;
        let mut next_wait = interval;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        trace!("discovery loop stopping");
                        return;
                    }
                }
                _ = self.rediscover.notified() => {
                    debug!("explicit rediscover requested");
                    interval = REDISCOVER_INTERVAL;
                    next_wait = Duration::from_millis(1);
                }
                _ = tokio::time::sleep(next_wait) => {
                    if self.reconcile().await {
                        interval = (interval * 2).min(MAX_INTERVAL);
                    } else {
                        debug!("no peers connected, re-bootstrapping underlay");
                        self.underlay.bootstrap().await;
                        self.underlay.refresh_routing_table().await;
                        interval = BOOTSTRAP_INTERVAL;
                    }
                    next_wait = interval;
                }
            }
        }
    }

    /// One reconciliation pass. Returns whether any configured peer is (or
    /// just became) connected.
    async fn reconcile(&self) -> bool {
        let peers: Vec<NodeId> = {
            let state = self.state.read().await;
            state.registry.list().iter().map(|p| p.id).collect()
        };

        let mut connected = false;
        for peer in &peers {
            if self.underlay.connectedness(*peer) {
                connected = true;
                continue;
            }
            let underlay = self.underlay.clone();
            let peer = *peer;
            tokio::spawn(async move {
                match underlay.dial(peer).await {
                    Ok(()) => debug!(peer = %peer, "dial succeeded"),
                    Err(e) => trace!(peer = %peer, error = %e, "dial failed"),
                }
            });
        }

        // A spawned dial may already have landed; look once more before
        // declaring isolation.
        if !connected {
            connected = peers.iter().any(|p| self.underlay.connectedness(*p));
        }
        connected
    }
}
