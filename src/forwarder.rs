//! # Packet Forwarder
//!
//! Two flows share the route table and otherwise run independently.
//!
//! **Egress** (interface → network): one task reads IP packets off the TUN
//! device, extracts the destination from the IP header, picks the owning peer
//! by longest-prefix-match, and writes the packet onto that peer's cached
//! stream. Every failure is a per-packet drop; nothing here can take the
//! daemon down.
//!
//! **Ingress** (network → interface): an accept loop spawns one reader per
//! inbound packet stream. Readers hand decoded packets to a single
//! device-writer task over a channel, so interface writes stay
//! single-producer. A reader exits on stream close or decode error; the
//! remote side will open a fresh stream for its next packet.
//!
//! Packets are never buffered beyond the per-stream OS buffer: backpressure
//! is a slow stream write slowing the egress loop, which only penalizes
//! traffic for the slow peer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::config::Shared;
use crate::device::TunDevice;
use crate::identity::NodeId;
use crate::streams::{PacketSource, StreamTable, MAX_PACKET_SIZE};
use crate::transport::Underlay;

/// Capacity of the readers → device-writer channel.
pub const INJECT_CHANNEL_SIZE: usize = 256;

/// Forward-path drop and delivery counters, readable by the control plane.
#[derive(Debug, Default)]
pub struct ForwarderCounters {
    pub forwarded: AtomicU64,
    pub injected: AtomicU64,
    pub dropped_no_route: AtomicU64,
    pub dropped_loopback: AtomicU64,
    pub dropped_send_failed: AtomicU64,
    pub dropped_malformed: AtomicU64,
}

impl ForwarderCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// IP header inspection
// ============================================================================

/// Destination address from a raw IP packet, by version nibble.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Ingress sanity check: version and length fields must be plausible for the
/// bytes actually received.
pub fn plausible(packet: &[u8]) -> bool {
    match packet.first().map(|b| b >> 4) {
        Some(4) => {
            if packet.len() < 20 {
                return false;
            }
            let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
            total_len >= 20 && total_len <= packet.len()
        }
        Some(6) => {
            if packet.len() < 40 {
                return false;
            }
            let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
            40 + payload_len <= packet.len()
        }
        _ => false,
    }
}

// ============================================================================
// Egress pump
// ============================================================================

pub async fn egress_pump(
    device: Arc<dyn TunDevice>,
    underlay: Arc<dyn Underlay>,
    state: Shared,
    counters: Arc<ForwarderCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let self_id = underlay.self_id();
    let mut streams = StreamTable::new(underlay);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let len = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            read = device.read_packet(&mut buf) => match read {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "interface read failed, egress pump exiting");
                    return;
                }
            },
        };

        forward_one(&buf[..len], self_id, &state, &mut streams, &counters).await;
    }
}

/// Route and send a single packet; all failures are drops.
async fn forward_one(
    packet: &[u8],
    self_id: NodeId,
    state: &Shared,
    streams: &mut StreamTable,
    counters: &ForwarderCounters,
) {
    let Some(dst) = destination(packet) else {
        ForwarderCounters::bump(&counters.dropped_malformed);
        return;
    };

    let target = {
        let state = state.read().await;
        state.table.lookup_longest(dst).map(|entry| entry.target)
    };
    let Some(target) = target else {
        trace!(dst = %dst, "no route, dropping packet");
        ForwarderCounters::bump(&counters.dropped_no_route);
        return;
    };

    if target == self_id {
        ForwarderCounters::bump(&counters.dropped_loopback);
        return;
    }

    let sink = match streams.get_or_open(target).await {
        Ok(sink) => sink,
        Err(e) => {
            debug!(peer = %target, error = %e, "no stream, dropping packet");
            ForwarderCounters::bump(&counters.dropped_send_failed);
            return;
        }
    };
    match sink.send_packet(packet).await {
        Ok(()) => {
            ForwarderCounters::bump(&counters.forwarded);
        }
        Err(e) => {
            debug!(peer = %target, error = %e, "send failed, discarding stream");
            streams.invalidate(&target);
            ForwarderCounters::bump(&counters.dropped_send_failed);
        }
    }
}

// ============================================================================
// Ingress pumps
// ============================================================================

/// Accept inbound packet streams and spawn a reader for each.
///
/// The acceptor is registered by the supervisor before this task starts, so
/// a stream arriving during boot is never orphaned.
pub async fn ingress_pump(
    mut acceptor: mpsc::Receiver<(NodeId, crate::streams::PacketStream)>,
    inject: mpsc::Sender<Vec<u8>>,
    counters: Arc<ForwarderCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            accepted = acceptor.recv() => {
                let Some((peer, stream)) = accepted else { return };
                debug!(peer = %peer, "inbound packet stream");
                tokio::spawn(stream_reader(
                    peer,
                    stream.source,
                    inject.clone(),
                    counters.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }
}

async fn stream_reader(
    peer: NodeId,
    mut source: PacketSource,
    inject: mpsc::Sender<Vec<u8>>,
    counters: Arc<ForwarderCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            received = source.recv_packet() => {
                match received {
                    Ok(packet) if plausible(&packet) => {
                        if inject.send(packet).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {
                        trace!(peer = %peer, "implausible packet from stream");
                        ForwarderCounters::bump(&counters.dropped_malformed);
                    }
                    Err(e) => {
                        debug!(peer = %peer, reason = %e, "packet stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// The single writer of the TUN device; serializes all peer readers.
pub async fn device_writer(
    device: Arc<dyn TunDevice>,
    mut inject: mpsc::Receiver<Vec<u8>>,
    counters: Arc<ForwarderCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            packet = inject.recv() => {
                let Some(packet) = packet else { return };
                match device.write_packet(&packet).await {
                    Ok(()) => {
                        ForwarderCounters::bump(&counters.injected);
                    }
                    Err(e) => {
                        debug!(error = %e, "interface write failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal IPv4 packet with the given destination.
    fn v4_packet(dst: Ipv4Addr) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&20u16.to_be_bytes());
        packet[16..20].copy_from_slice(&dst.octets());
        packet
    }

    fn v6_packet(dst: Ipv6Addr) -> Vec<u8> {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&0u16.to_be_bytes());
        packet[24..40].copy_from_slice(&dst.octets());
        packet
    }

    #[test]
    fn destination_extracts_v4() {
        let dst = Ipv4Addr::new(10, 42, 3, 4);
        assert_eq!(destination(&v4_packet(dst)), Some(IpAddr::V4(dst)));
    }

    #[test]
    fn destination_extracts_v6() {
        let dst: Ipv6Addr = "fd53:6b6e::1234".parse().unwrap();
        assert_eq!(destination(&v6_packet(dst)), Some(IpAddr::V6(dst)));
    }

    #[test]
    fn destination_rejects_malformed() {
        assert_eq!(destination(&[]), None);
        assert_eq!(destination(&[0x45; 10]), None); // truncated v4
        assert_eq!(destination(&[0x60; 24]), None); // truncated v6
        assert_eq!(destination(&[0x05, 0, 0, 0]), None); // bogus version
    }

    #[test]
    fn plausible_validates_lengths() {
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        assert!(plausible(&v4_packet(dst)));
        assert!(plausible(&v6_packet("fd53:6b6e::1".parse().unwrap())));

        // v4 total-length larger than the bytes on the wire
        let mut bad = v4_packet(dst);
        bad[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(!plausible(&bad));

        // v6 payload-length larger than the bytes on the wire
        let mut bad6 = v6_packet("fd53:6b6e::1".parse().unwrap());
        bad6[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert!(!plausible(&bad6));

        assert!(!plausible(&[]));
        assert!(!plausible(&[0x45; 8]));
    }

    #[test]
    fn padded_v4_packet_is_plausible() {
        let mut packet = v4_packet(Ipv4Addr::new(10, 0, 0, 1));
        packet.extend_from_slice(&[0u8; 26]); // link-layer padding
        assert!(plausible(&packet));
    }
}
