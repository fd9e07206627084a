//! Peer identity: hostname verification, certificate pinning, and the record
//! of a completed handshake.

use std::fmt;

use rustls::pki_types::{CertificateDer, ServerName};
use thiserror::Error;

use crate::address::Protocol;
use crate::tls::TlsVersion;

/// The outcome of a completed TLS handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Name of the TLS configuration that produced this handshake.
    pub config: &'static str,
    /// The negotiated protocol version.
    pub version: Option<TlsVersion>,
    /// The negotiated cipher suite, by its standard name.
    pub cipher_suite: Option<String>,
    /// The application protocol agreed through ALPN.
    pub alpn: Option<Protocol>,
    /// The peer's certificate chain, end-entity first.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Decides whether a peer certificate chain is acceptable for a hostname.
///
/// This runs after rustls's own chain validation; it is the hook used to
/// answer "does this already-established connection also cover that other
/// hostname?" when coalescing connections.
pub trait HostVerifier: Send + Sync + fmt::Debug {
    /// Check that `certificates` (end-entity first) cover `host`.
    fn verify(&self, host: &str, certificates: &[CertificateDer<'static>]) -> bool;

    /// Whether this is the standard verifier.
    ///
    /// Connections verified by a custom verifier are never shared across
    /// hostnames.
    fn is_default(&self) -> bool {
        false
    }
}

/// The standard verifier: matches `host` against the end-entity
/// certificate's subject names.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHostVerifier;

impl HostVerifier for DefaultHostVerifier {
    fn verify(&self, host: &str, certificates: &[CertificateDer<'static>]) -> bool {
        let Some(end_entity) = certificates.first() else {
            return false;
        };
        let Ok(certificate) = rustls::server::ParsedCertificate::try_from(end_entity) else {
            return false;
        };
        let Ok(name) = ServerName::try_from(host.to_owned()) else {
            return false;
        };
        rustls::client::verify_server_name(&certificate, &name).is_ok()
    }

    fn is_default(&self) -> bool {
        true
    }
}

/// A certificate pin was not satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("certificate pinning failure for {host}")]
pub struct PinError {
    /// The hostname whose pins were violated.
    pub host: String,
}

/// Constrains which certificates a host may present.
pub trait CertificatePinner: Send + Sync + fmt::Debug {
    /// Check `certificates` (end-entity first) against the pins for `host`.
    fn check(&self, host: &str, certificates: &[CertificateDer<'static>]) -> Result<(), PinError>;
}

/// A pinner with no pins. Every chain passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPins;

impl CertificatePinner for NoPins {
    fn check(&self, _host: &str, _certificates: &[CertificateDer<'static>]) -> Result<(), PinError> {
        Ok(())
    }
}
