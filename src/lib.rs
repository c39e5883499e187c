//! # skein - Encrypted Overlay Network Daemon
//!
//! skein builds an encrypted mesh of hosts identified by public-key-derived
//! node ids. Each node exposes a TUN interface; IP packets written to it are
//! forwarded over authenticated QUIC streams to the peer whose overlay
//! address (derived deterministically from its node id) owns the destination
//! prefix, and packets received from peers are injected back into the local
//! stack.
//!
//! ## Architecture
//!
//! Shared state (the peer registry and the route table) lives behind one
//! read-write lock with a single-writer policy: the supervisor serializes
//! every control-plane mutation, while the forwarder hot paths and the
//! discovery loop only ever read. Long-running work is plain tokio tasks
//! coordinated by a shutdown watch channel.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Node ids, keypairs, deterministic overlay address derivation |
//! | `routes` | Longest-prefix-match route table (per-family prefix tries) |
//! | `peers` | Peer records and the three-way-indexed registry |
//! | `config` | JSON configuration loading and the shared state handle |
//! | `gate` | Recursion gate vetoing underlay dials into overlay-routed space |
//! | `discovery` | Connect-to-everyone reconciliation loop with adaptive backoff |
//! | `streams` | Length-prefixed packet framing and the per-peer stream cache |
//! | `forwarder` | Interface→network and network→interface packet pumps |
//! | `transport` | `Underlay` trait and the QUIC implementation |
//! | `crypto` | Ed25519 identity certificates and digest-binding verifiers |
//! | `device` | `TunDevice` trait, Linux TUN backend, in-memory test device |
//! | `supervisor` | Component wiring, control-plane mutations, bounded shutdown |
//! | `rpc` | Line-delimited JSON control channel (Unix socket or loopback TCP) |

pub mod config;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod forwarder;
pub mod gate;
pub mod identity;
pub mod peers;
pub mod routes;
pub mod rpc;
pub mod streams;
pub mod supervisor;
pub mod transport;

pub use config::{Config, NetState, Shared};
pub use device::{MemoryTun, TunDevice};
pub use gate::DialGate;
pub use identity::{derive_v4, derive_v6, netid, Keypair, NodeId};
pub use peers::{Peer, PeerRegistry};
pub use routes::{Prefix, RouteEntry, RouteTable};
pub use streams::{PacketSink, PacketSource, PacketStream};
pub use supervisor::{ControlError, Supervisor};
pub use transport::{QuicUnderlay, Underlay, PACKET_PROTOCOL};
