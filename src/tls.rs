//! TLS configurations and the fallback ladder.
//!
//! A [`TlsSpec`] names a negotiation posture: which protocol versions and
//! cipher suites to offer, and whether TLS extensions (ALPN, SNI) are used.
//! Connection attempts walk the address's spec list through a single-use
//! [`SpecSelector`]: each handshake failure that is not terminal moves to
//! the next compatible spec, and every attempt after the first advertises
//! the fallback signal suite when the stack supports it.

use std::sync::Arc;

use crate::address::{Protocol, TlsMaterials};
use crate::error::{ConnectError, TlsError};

/// A TLS protocol version this crate can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    /// TLS 1.3
    Tls13,
    /// TLS 1.2
    Tls12,
}

impl TlsVersion {
    /// The standard name, e.g. `TLSv1.3`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls13 => "TLSv1.3",
            TlsVersion::Tls12 => "TLSv1.2",
        }
    }

    pub(crate) fn supported(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls13 => &rustls::version::TLS13,
            TlsVersion::Tls12 => &rustls::version::TLS12,
        }
    }

    pub(crate) fn from_rustls(version: rustls::ProtocolVersion) -> Option<Self> {
        match version {
            rustls::ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
            rustls::ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
            _ => None,
        }
    }
}

/// Marker suite a client offers to signal a deliberate protocol downgrade,
/// letting servers reject downgrade attacks.
pub const FALLBACK_SIGNAL_SUITE: &str = "TLS_FALLBACK_SCSV";

const RESTRICTED_SUITES: &[&str] = &[
    "TLS13_AES_256_GCM_SHA384",
    "TLS13_AES_128_GCM_SHA256",
    "TLS13_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
];

/// A named TLS negotiation posture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsSpec {
    name: &'static str,
    secure: bool,
    versions: Option<Vec<TlsVersion>>,
    suites: Option<Vec<&'static str>>,
    supports_extensions: bool,
}

impl TlsSpec {
    /// No TLS at all. The only spec usable with a cleartext origin.
    pub fn cleartext() -> Self {
        Self {
            name: "CLEARTEXT",
            secure: false,
            versions: None,
            suites: None,
            supports_extensions: false,
        }
    }

    /// A strict configuration for services with current TLS stacks.
    pub fn restricted_tls() -> Self {
        Self {
            name: "RESTRICTED_TLS",
            secure: true,
            versions: Some(vec![TlsVersion::Tls13]),
            suites: Some(RESTRICTED_SUITES.to_vec()),
            supports_extensions: true,
        }
    }

    /// The default configuration for mainstream servers.
    pub fn modern_tls() -> Self {
        Self {
            name: "MODERN_TLS",
            secure: true,
            versions: Some(vec![TlsVersion::Tls13, TlsVersion::Tls12]),
            suites: Some(RESTRICTED_SUITES.to_vec()),
            supports_extensions: true,
        }
    }

    /// A permissive configuration: every version and suite the local stack
    /// enables.
    pub fn compatible_tls() -> Self {
        Self {
            name: "COMPATIBLE_TLS",
            secure: true,
            versions: None,
            suites: None,
            supports_extensions: true,
        }
    }

    /// This spec's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this spec negotiates TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether this spec uses TLS extensions (ALPN, SNI).
    pub fn supports_extensions(&self) -> bool {
        self.supports_extensions
    }

    /// Whether this spec can be negotiated given what the local stack
    /// offers: at least one version and one suite must remain after
    /// intersection.
    pub fn is_compatible(&self, capabilities: &SocketCapabilities) -> bool {
        if !self.secure {
            return false;
        }
        if let Some(versions) = &self.versions {
            if !versions
                .iter()
                .any(|v| capabilities.enabled_versions.contains(v))
            {
                return false;
            }
        }
        if let Some(suites) = &self.suites {
            if !suites
                .iter()
                .any(|s| capabilities.enabled_suites.iter().any(|e| e == s))
            {
                return false;
            }
        }
        true
    }

    pub(crate) fn effective(
        &self,
        capabilities: &SocketCapabilities,
        is_fallback: bool,
    ) -> EffectiveSpec {
        let versions = match &self.versions {
            Some(versions) => versions
                .iter()
                .copied()
                .filter(|v| capabilities.enabled_versions.contains(v))
                .collect(),
            None => capabilities.enabled_versions.clone(),
        };
        let mut suites: Vec<String> = match &self.suites {
            Some(suites) => suites
                .iter()
                .filter(|s| capabilities.enabled_suites.iter().any(|e| e == *s))
                .map(|s| (*s).to_owned())
                .collect(),
            None => capabilities.enabled_suites.clone(),
        };
        if is_fallback
            && capabilities
                .supported_suites
                .iter()
                .any(|s| s == FALLBACK_SIGNAL_SUITE)
        {
            suites.push(FALLBACK_SIGNAL_SUITE.to_owned());
        }
        EffectiveSpec {
            name: self.name,
            versions,
            suites,
            supports_extensions: self.supports_extensions,
        }
    }
}

/// What the local TLS stack offers for a connection attempt.
#[derive(Debug, Clone)]
pub struct SocketCapabilities {
    /// Protocol versions the stack will negotiate.
    pub enabled_versions: Vec<TlsVersion>,
    /// Cipher suites the stack will offer, by standard name.
    pub enabled_suites: Vec<String>,
    /// Every suite the stack knows of, possibly wider than the enabled set.
    pub supported_suites: Vec<String>,
}

impl SocketCapabilities {
    /// Capabilities of the process crypto provider.
    pub fn from_provider() -> Self {
        let provider = rustls::crypto::ring::default_provider();
        let enabled_suites: Vec<String> = provider
            .cipher_suites
            .iter()
            .map(|suite| format!("{:?}", suite.suite()))
            .collect();
        Self {
            enabled_versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            supported_suites: enabled_suites.clone(),
            enabled_suites,
        }
    }
}

/// A [`TlsSpec`] intersected with the stack's capabilities, ready to apply.
#[derive(Debug, Clone)]
pub struct EffectiveSpec {
    /// Name of the originating spec.
    pub name: &'static str,
    /// Versions to offer.
    pub versions: Vec<TlsVersion>,
    /// Suites to offer, including the fallback signal when applicable.
    pub suites: Vec<String>,
    /// Whether to use TLS extensions.
    pub supports_extensions: bool,
}

/// Walks an address's spec list across the handshake attempts of a single
/// connection. Single use: a new connection gets a new selector.
#[derive(Debug)]
pub struct SpecSelector {
    specs: Vec<TlsSpec>,
    next_index: usize,
    is_fallback: bool,
    fallback_possible: bool,
}

impl SpecSelector {
    /// A selector over `specs` in fallback order.
    pub fn new(specs: Vec<TlsSpec>) -> Self {
        Self {
            specs,
            next_index: 0,
            is_fallback: false,
            fallback_possible: false,
        }
    }

    /// Pick the next compatible spec and intersect it with `capabilities`.
    ///
    /// Fails when no secure spec at or after the current position is
    /// compatible with the stack.
    pub fn configure(
        &mut self,
        capabilities: &SocketCapabilities,
    ) -> Result<EffectiveSpec, TlsError> {
        let mut selected = None;
        for index in self.next_index..self.specs.len() {
            if self.specs[index].is_compatible(capabilities) {
                selected = Some(index);
                self.next_index = index + 1;
                break;
            }
        }
        let Some(index) = selected else {
            return Err(TlsError::UnsupportedProtocols(format!(
                "versions {:?}, {} suites enabled, fallback={}",
                capabilities.enabled_versions,
                capabilities.enabled_suites.len(),
                self.is_fallback,
            )));
        };
        self.fallback_possible = self.specs[self.next_index..]
            .iter()
            .any(|spec| spec.is_compatible(capabilities));

        let effective = self.specs[index].effective(capabilities, self.is_fallback);
        tracing::trace!(spec = effective.name, fallback = self.is_fallback, "configured TLS");
        Ok(effective)
    }

    /// Note a handshake failure. Returns whether another attempt with the
    /// next spec is worthwhile.
    ///
    /// Protocol violations, interrupts and timeouts, certificate validation
    /// failures and peer identity failures are terminal; any other secure
    /// transport error permits fallback.
    pub fn connection_failed(&mut self, error: &ConnectError) -> bool {
        // Every attempt after the first failure is a fallback attempt.
        self.is_fallback = true;
        self.fallback_possible && retryable(error)
    }
}

fn retryable(error: &ConnectError) -> bool {
    let ConnectError::Tls(tls) = error else {
        return false;
    };
    match tls {
        TlsError::Handshake(io) => {
            if matches!(
                io.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ) {
                return false;
            }
            // Certificate validation failures will not be fixed by offering
            // an older protocol version.
            let mut source: Option<&(dyn std::error::Error + 'static)> = io.get_ref().map(|e| e as _);
            while let Some(error) = source {
                if let Some(rustls::Error::InvalidCertificate(_)) =
                    error.downcast_ref::<rustls::Error>()
                {
                    return false;
                }
                source = error.source();
            }
            true
        }
        TlsError::HostnameNotVerified { .. } | TlsError::Pinning(_) => false,
        TlsError::UnsupportedProtocols(_) | TlsError::ServerName(_) => false,
    }
}

/// Build a rustls client configuration applying `effective` to `materials`.
pub(crate) fn client_config(
    materials: &TlsMaterials,
    effective: &EffectiveSpec,
    protocols: &[Protocol],
) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let base = rustls::crypto::ring::default_provider();
    let cipher_suites: Vec<_> = base
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite());
            effective.suites.iter().any(|s| *s == name)
        })
        .collect();
    let provider = rustls::crypto::CryptoProvider {
        cipher_suites,
        ..base
    };

    let versions: Vec<&'static rustls::SupportedProtocolVersion> =
        effective.versions.iter().map(|v| v.supported()).collect();

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)
        .map_err(|error| TlsError::UnsupportedProtocols(error.to_string()))?
        .with_root_certificates(materials.roots.clone())
        .with_no_client_auth();

    if effective.supports_extensions {
        config.alpn_protocols = protocols
            .iter()
            .filter(|p| **p != Protocol::H2PriorKnowledge)
            .map(|p| p.alpn_id().to_vec())
            .collect();
    }
    Ok(Arc::new(config))
}
