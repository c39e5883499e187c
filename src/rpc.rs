//! # Control-Plane RPC
//!
//! A small line-delimited JSON protocol over a local socket, consumed by the
//! CLI front-end. Each request line is an object with a `method` and optional
//! `params`; each response line is `{"ok": ...}` or
//! `{"error": {"code", "message"}}`, with error codes surfacing
//! [`ControlError`] variants verbatim.
//!
//! The channel is pluggable: a Unix domain socket (default) or a loopback
//! TCP listener that writes its bound port to a file so the front-end can
//! find it. Both speak the same protocol; the family is purely a deployment
//! choice.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::supervisor::{ControlError, Supervisor};

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params")]
enum RpcRequest {
    Status,
    ListPeers,
    ListRoutes,
    AddRoute { prefix: String, peer: String },
    RemoveRoute { prefix: String },
    AddPeer { name: String, id: String },
    RemovePeer { peer: String },
    Rediscover,
}

// ============================================================================
// Listener configuration
// ============================================================================

/// Where the control channel listens.
#[derive(Debug, Clone)]
pub enum ControlListener {
    /// Unix domain socket at the given path.
    Unix(PathBuf),
    /// Loopback TCP; the bound port is written to the port file.
    Tcp {
        addr: std::net::SocketAddr,
        port_file: PathBuf,
    },
}

impl ControlListener {
    /// Parse a `unix:<path>` or `tcp:<addr>` listener spec.
    pub fn from_spec(spec: &str, interface: &str) -> Result<Self> {
        if let Some(path) = spec.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = spec.strip_prefix("tcp:") {
            let addr: std::net::SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid control listen address {addr}"))?;
            if !addr.ip().is_loopback() {
                bail!("control channel over TCP must bind loopback");
            }
            return Ok(Self::Tcp {
                addr,
                port_file: PathBuf::from(format!("/run/skein/{interface}.port")),
            });
        }
        bail!("control listener spec must start with unix: or tcp:")
    }

    /// Default: a Unix socket named after the interface.
    pub fn default_for(interface: &str) -> Self {
        Self::Unix(PathBuf::from(format!("/run/skein/{interface}.sock")))
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve control requests until shutdown.
pub async fn serve(
    supervisor: Arc<Supervisor>,
    listener: ControlListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match listener {
        ControlListener::Unix(path) => {
            // A previous run may have left its socket behind.
            let _ = std::fs::remove_file(&path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("failed to bind control socket {}", path.display()))?;
            info!(socket = %path.display(), "control channel ready");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        let (stream, _) = accepted.context("control socket accept failed")?;
                        tokio::spawn(handle_connection(supervisor.clone(), stream));
                    }
                }
            }
            let _ = std::fs::remove_file(&path);
        }
        ControlListener::Tcp { addr, port_file } => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind control listener {addr}"))?;
            let local = listener.local_addr()?;
            if let Some(parent) = port_file.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&port_file, format!("{}\n", local.port()))
                .with_context(|| format!("failed to write port file {}", port_file.display()))?;
            info!(addr = %local, port_file = %port_file.display(), "control channel ready");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        let (stream, _) = accepted.context("control listener accept failed")?;
                        tokio::spawn(handle_connection(supervisor.clone(), stream));
                    }
                }
            }
            let _ = std::fs::remove_file(&port_file);
        }
    }

    info!("control channel closed");
    Ok(())
}

async fn handle_connection<S>(supervisor: Arc<Supervisor>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "control connection read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&supervisor, &line).await;
        let mut encoded = response.to_string();
        encoded.push('\n');
        if let Err(e) = writer.write_all(encoded.as_bytes()).await {
            debug!(error = %e, "control connection write failed");
            return;
        }
    }
}

/// Decode one request line and run it against the supervisor.
pub async fn dispatch(supervisor: &Supervisor, line: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "malformed control request");
            return json!({
                "error": { "code": "BadRequest", "message": e.to_string() }
            });
        }
    };

    match request {
        RpcRequest::Status => ok(serde_json::to_value(supervisor.status().await)),
        RpcRequest::ListPeers => ok(serde_json::to_value(supervisor.list_peers().await)),
        RpcRequest::ListRoutes => ok(serde_json::to_value(supervisor.list_routes().await)),
        RpcRequest::AddRoute { prefix, peer } => {
            result(supervisor.add_route(&prefix, &peer).await)
        }
        RpcRequest::RemoveRoute { prefix } => result(supervisor.remove_route(&prefix).await),
        RpcRequest::AddPeer { name, id } => result(supervisor.add_peer(&name, &id).await),
        RpcRequest::RemovePeer { peer } => result(supervisor.remove_peer(&peer).await),
        RpcRequest::Rediscover => {
            supervisor.rediscover();
            json!({ "ok": null })
        }
    }
}

fn ok(value: serde_json::Result<Value>) -> Value {
    match value {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({
            "error": { "code": "Internal", "message": e.to_string() }
        }),
    }
}

fn result(outcome: Result<(), ControlError>) -> Value {
    match outcome {
        Ok(()) => json!({ "ok": null }),
        Err(e) => json!({
            "error": { "code": e.code(), "message": e.to_string() }
        }),
    }
}
