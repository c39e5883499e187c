//! # Packet Streams
//!
//! One logical bidirectional packet stream runs per connected peer, tagged
//! with the overlay protocol identifier. Packets are framed with an unsigned
//! big-endian 16-bit length prefix followed by the raw IP packet octets.
//!
//! A frame longer than [`MAX_PACKET_SIZE`] is a protocol violation: the
//! receiver stops reading and the stream is torn down. Zero-length frames are
//! treated the same way.
//!
//! The [`StreamTable`] caches the send half of the per-peer stream. Streams
//! open lazily on first send and are discarded on failure; the next packet
//! for that peer opens a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::identity::NodeId;
use crate::transport::{Underlay, PACKET_PROTOCOL};

/// Interface MTU, and therefore the largest frame either side will accept.
pub const MAX_PACKET_SIZE: usize = 1420;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

// ============================================================================
// Framing
// ============================================================================

/// Receiving half of a packet stream.
pub struct PacketSource {
    inner: BoxedRead,
}

impl PacketSource {
    pub fn new(inner: BoxedRead) -> Self {
        Self { inner }
    }

    /// Read one frame. Errors are terminal for the stream.
    pub async fn recv_packet(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.inner
            .read_exact(&mut len_buf)
            .await
            .context("stream closed while reading frame length")?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_PACKET_SIZE {
            bail!("frame length {len} outside (0, {MAX_PACKET_SIZE}]");
        }

        let mut packet = vec![0u8; len];
        self.inner
            .read_exact(&mut packet)
            .await
            .context("stream closed mid-frame")?;
        Ok(packet)
    }
}

/// Sending half of a packet stream.
pub struct PacketSink {
    inner: BoxedWrite,
}

impl PacketSink {
    pub fn new(inner: BoxedWrite) -> Self {
        Self { inner }
    }

    pub async fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        if packet.is_empty() || packet.len() > MAX_PACKET_SIZE {
            bail!("packet length {} outside (0, {MAX_PACKET_SIZE}]", packet.len());
        }
        let len = (packet.len() as u16).to_be_bytes();
        self.inner.write_all(&len).await?;
        self.inner.write_all(packet).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// A full bidirectional packet stream as handed out by the underlay.
pub struct PacketStream {
    pub source: PacketSource,
    pub sink: PacketSink,
}

impl PacketStream {
    pub fn new(read: BoxedRead, write: BoxedWrite) -> Self {
        Self {
            source: PacketSource::new(read),
            sink: PacketSink::new(write),
        }
    }
}

// ============================================================================
// Per-peer stream cache
// ============================================================================

/// Cache of outbound packet streams, owned by the egress pump.
///
/// Only the send half is retained: inbound traffic arrives on streams the
/// *remote* side opened, handled by the ingress pump.
pub struct StreamTable {
    underlay: Arc<dyn Underlay>,
    streams: HashMap<NodeId, PacketSink>,
}

impl StreamTable {
    pub fn new(underlay: Arc<dyn Underlay>) -> Self {
        Self {
            underlay,
            streams: HashMap::new(),
        }
    }

    /// The cached stream to `peer`, opening one if needed.
    pub async fn get_or_open(&mut self, peer: NodeId) -> Result<&mut PacketSink> {
        if !self.streams.contains_key(&peer) {
            let stream = self
                .underlay
                .open_stream(peer, PACKET_PROTOCOL)
                .await
                .with_context(|| format!("failed to open packet stream to {peer}"))?;
            debug!(peer = %peer, "opened packet stream");
            self.streams.insert(peer, stream.sink);
        }
        Ok(self.streams.get_mut(&peer).expect("just inserted"))
    }

    /// Drop the cached stream after a send failure or observed close.
    pub fn invalidate(&mut self, peer: &NodeId) {
        if self.streams.remove(peer).is_some() {
            debug!(peer = %peer, "discarded packet stream");
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
