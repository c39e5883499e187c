//! # Transport Cryptography
//!
//! TLS plumbing for the QUIC underlay. Every node presents a self-signed
//! certificate generated from its Ed25519 keypair; there is no CA. Trust is
//! the binding between the certificate's public key and the node id: the id
//! is the BLAKE3 digest of the key, so both sides recompute the digest from
//! the presented certificate and compare.
//!
//! - Outbound: the dialer puts the expected node id (base-36 form, a single
//!   DNS label) in the SNI; the server-certificate verifier recomputes the
//!   digest of the presented key and requires it to equal the SNI id.
//! - Inbound: client certificates are mandatory; the verifier requires a
//!   valid Ed25519 key, and the connection's node id is derived from it
//!   after the handshake.
//!
//! The `dangerous()` rustls APIs are used deliberately: verification is
//! digest binding, not chain validation.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, NodeId};

/// ALPN protocol identifier for all underlay connections.
pub const ALPN: &[u8] = b"skein";

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Idle timeout applied to underlay connections.
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

// ============================================================================
// Certificate generation
// ============================================================================

/// Build a self-signed certificate whose subject public key is the node's
/// Ed25519 key. The CN carries the base-36 node id for debuggability only.
pub fn generate_node_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pkcs8 = ed25519_pkcs8(&keypair.secret_key_bytes());
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let rcgen_key = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to load Ed25519 key for certificate generation")?;

    let mut params = rcgen::CertificateParams::new(vec!["skein".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.node_id().to_base36()),
    );

    let cert = params
        .self_signed(&rcgen_key)
        .context("failed to self-sign node certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

/// Minimal PKCS#8 v1 wrapping of a raw Ed25519 seed.
fn ed25519_pkcs8(secret: &[u8; 32]) -> Vec<u8> {
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    let mut out = Vec::with_capacity(48);
    out.extend_from_slice(&[0x30, 0x2e]); // PrivateKeyInfo
    out.extend_from_slice(&[0x02, 0x01, 0x00]); // version 0
    out.extend_from_slice(&[0x30, 0x05]); // AlgorithmIdentifier
    out.extend_from_slice(&ED25519_OID);
    out.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]); // OCTET STRING(OCTET STRING(seed))
    out.extend_from_slice(secret);
    out
}

// ============================================================================
// Endpoint configuration
// ============================================================================

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(NodeClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to build server TLS config")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .context("failed to build QUIC server config")?,
    ));
    config.migration(true);

    let transport = Arc::get_mut(&mut config.transport)
        .expect("transport config exclusively owned at construction");
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT.try_into().expect("idle timeout fits VarInt"),
    ));
    transport.max_concurrent_bidi_streams(64u32.into());

    Ok(config)
}

pub fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NodeServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to build client TLS config")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .context("failed to build QUIC client config")?,
    )))
}

// ============================================================================
// Identity extraction and SNI binding
// ============================================================================

pub fn public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    let key: [u8; 32] = key_bytes.as_ref().try_into().ok()?;
    // Require a decodable Ed25519 point, not just 32 bytes.
    VerifyingKey::from_bytes(&key).ok()?;
    Some(key)
}

/// Node id of the remote end of a handshaken connection, if its certificate
/// carries a valid Ed25519 key.
pub fn verified_node_id(connection: &quinn::Connection) -> Option<NodeId> {
    let identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = identity.downcast_ref()?;
    let key = public_key_from_cert(certs.first()?.as_ref())?;
    Some(NodeId::from_public_key(&key))
}

/// The SNI used when dialing a peer: its base-36 id, which fits one DNS label.
pub fn node_id_to_sni(id: &NodeId) -> String {
    id.to_base36()
}

fn node_id_from_sni(sni: &str) -> Option<NodeId> {
    NodeId::parse(sni).ok()
}

// ============================================================================
// Verifiers
// ============================================================================

/// Server side: accept any client presenting a valid Ed25519 certificate.
/// The node id is derived from the key after the handshake; which ids are
/// *interesting* is the peer registry's business, not the TLS layer's.
#[derive(Debug)]
struct NodeClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for NodeClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        public_key_from_cert(end_entity.as_ref()).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Client side: the presented key's digest must equal the node id we dialed
/// (carried in the SNI).
#[derive(Debug)]
struct NodeServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NodeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ))
            }
        };
        let expected = node_id_from_sni(sni).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;

        let key = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if NodeId::from_public_key(&key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_public_key_recovers_node_id() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_node_cert(&keypair).expect("cert generation");
            let key = public_key_from_cert(certs[0].as_ref()).expect("key extraction");
            assert_eq!(key, keypair.public_key_bytes());
            assert_eq!(NodeId::from_public_key(&key), keypair.node_id());
        }
    }

    #[test]
    fn sni_roundtrip() {
        let id = Keypair::generate().node_id();
        let sni = node_id_to_sni(&id);
        assert!(sni.len() <= 63, "SNI must fit a single DNS label");
        assert_eq!(node_id_from_sni(&sni), Some(id));
        assert_eq!(node_id_from_sni("not-an-id!"), None);
    }

    #[test]
    fn garbage_certificate_yields_no_key() {
        assert_eq!(public_key_from_cert(&[0u8; 64]), None);
    }
}
