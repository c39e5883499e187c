//! # Node Identity and Overlay Address Derivation
//!
//! This module defines the identity types used throughout skein:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`NodeId`]: 32-byte BLAKE3 digest of the public key, the node's overlay identity
//! - [`derive_v4`] / [`derive_v6`]: deterministic overlay addresses computed from a [`NodeId`]
//!
//! ## Identity Model
//!
//! A node's identity is the BLAKE3 digest of its Ed25519 public key. The digest
//! (not the raw key) is what appears in configuration files, route targets, and
//! overlay addresses, so the identity is a canonical public-key digest: anyone
//! holding the public key can recompute and verify it, and the transport layer
//! checks this binding on both directions of every connection.
//!
//! ## Address Layout (frozen)
//!
//! Two implementations interoperate iff they agree bit-for-bit on this layout,
//! so it is fixed:
//!
//! ```text
//! digest d = BLAKE3(ed25519 public key)          (32 bytes)
//!
//! v4  = 10 . d[0] . d[1] . d[2]                  (10.0.0.0/8)
//! v6  = fd53:6b6e:: | d[0..10]                   (fd53:6b6e::/32 ULA)
//!       octets: [fd, 53, 6b, 6e, 00, 00, d0, d1, d2, d3, d4, d5, d6, d7, d8, d9]
//! netid = last 4 octets of v6 = d[6..10]
//! ```
//!
//! The v6 address carries 80 digest bits, so two distinct ids collide only with
//! negligible probability. The v4 address carries 24 bits and is only locally
//! unique; it is stable across runs for the same id. The netid inherits BLAKE3's
//! uniform output distribution.
//!
//! ## Textual Forms
//!
//! The canonical display form is base-36: a `k` prefix followed by the digest
//! encoded as a big-endian base-36 integer (leading zero bytes become leading
//! `0` digits so round-trips are exact). A legacy 64-character lowercase hex
//! form is also accepted everywhere ids are parsed.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Prefix length the overlay claims for IPv4 (`10.0.0.0/8`).
pub const OVERLAY_PREFIX4_LEN: u8 = 8;

/// Prefix length the overlay claims for IPv6 (`fd53:6b6e::/32`).
pub const OVERLAY_PREFIX6_LEN: u8 = 32;

/// Fixed top octets of every derived IPv6 address.
const V6_PREFIX: [u8; 6] = [0xfd, 0x53, 0x6b, 0x6e, 0x00, 0x00];

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Error type for textual [`NodeId`] parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("id is empty")]
    Empty,
    #[error("id contains an invalid character")]
    InvalidCharacter,
    #[error("id does not decode to 32 bytes")]
    WrongLength,
}

// ============================================================================
// NodeId
// ============================================================================

/// The overlay identity of a node: BLAKE3 digest of its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Compute the identity for a public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Canonical textual form: `k` + base-36 of the digest bytes.
    pub fn to_base36(&self) -> String {
        let mut out = String::with_capacity(51);
        out.push('k');
        out.push_str(&base36_encode(&self.0));
        out
    }

    /// Legacy canonical form: 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
        let bytes = hex::decode(s).map_err(|_| IdParseError::InvalidCharacter)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| IdParseError::WrongLength)?;
        Ok(Self(arr))
    }

    /// Parse either textual form. A leading `k` selects base-36, anything
    /// else is treated as legacy hex.
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if s.is_empty() {
            return Err(IdParseError::Empty);
        }
        match s.strip_prefix('k') {
            Some(rest) => {
                let bytes = base36_decode(rest)?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| IdParseError::WrongLength)?;
                Ok(Self(arr))
            }
            None => Self::from_hex(s),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base36())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Address derivation
// ============================================================================

/// Built-in IPv4 address for an id: `10.d0.d1.d2`.
pub fn derive_v4(id: &NodeId) -> Ipv4Addr {
    let d = id.as_bytes();
    Ipv4Addr::new(10, d[0], d[1], d[2])
}

/// Built-in IPv6 address for an id: the overlay ULA prefix + first 10 digest bytes.
pub fn derive_v6(id: &NodeId) -> Ipv6Addr {
    let d = id.as_bytes();
    let mut octets = [0u8; 16];
    octets[..6].copy_from_slice(&V6_PREFIX);
    octets[6..16].copy_from_slice(&d[..10]);
    Ipv6Addr::from(octets)
}

/// Compact secondary key: the last 4 octets of the derived IPv6 address.
pub fn netid(id: &NodeId) -> [u8; 4] {
    let octets = derive_v6(id).octets();
    [octets[12], octets[13], octets[14], octets[15]]
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 keypair backing a node's identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().to_base36())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Base-36 integer codec
// ============================================================================

fn base36_encode(bytes: &[u8]) -> String {
    // Little-endian base-36 digit accumulator.
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 36) as u8;
            carry /= 36;
        }
        while carry > 0 {
            digits.push((carry % 36) as u8);
            carry /= 36;
        }
    }

    let leading_zeros = bytes.iter().take_while(|&&b| b == 0).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('0');
    }
    for &digit in digits.iter().rev() {
        out.push(BASE36_ALPHABET[digit as usize] as char);
    }
    out
}

fn base36_decode(s: &str) -> Result<Vec<u8>, IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }

    let mut bytes: Vec<u8> = Vec::with_capacity(32);
    for c in s.bytes() {
        let value = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'z' => c - b'a' + 10,
            b'A'..=b'Z' => c - b'A' + 10,
            _ => return Err(IdParseError::InvalidCharacter),
        } as u32;

        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 36;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    for c in s.bytes() {
        if c == b'0' {
            bytes.push(0);
        } else {
            break;
        }
    }

    bytes.reverse();
    Ok(bytes)
}
