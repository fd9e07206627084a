//! Target origin identity.
//!
//! An [`Address`] bundles everything needed to reach one origin: host, port,
//! TLS materials, proxy policy, protocols and the resolver. Two addresses
//! that agree on everything except the host can share connections, which is
//! what makes connection coalescing safe. See [`Address::equals_non_host`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::dns::{Dns, SystemDns};
use crate::secure::{CertificatePinner, HostVerifier};
use crate::tls::TlsSpec;

/// An application protocol carried over an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1. One exchange at a time.
    Http11,
    /// HTTP/2 negotiated through ALPN.
    H2,
    /// HTTP/2 over cleartext, without negotiation.
    H2PriorKnowledge,
}

impl Protocol {
    /// The ALPN protocol identifier.
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            Protocol::Http11 => b"http/1.1",
            Protocol::H2 | Protocol::H2PriorKnowledge => b"h2",
        }
    }

    /// Whether the protocol multiplexes exchanges over one connection.
    pub fn is_multiplexed(&self) -> bool {
        !matches!(self, Protocol::Http11)
    }

    pub(crate) fn from_alpn(id: &[u8]) -> Option<Protocol> {
        match id {
            b"h2" => Some(Protocol::H2),
            b"http/1.1" => Some(Protocol::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http11 => f.write_str("http/1.1"),
            Protocol::H2 => f.write_str("h2"),
            Protocol::H2PriorKnowledge => f.write_str("h2 (prior knowledge)"),
        }
    }
}

/// How to reach the origin: directly, or through an HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect straight to the origin.
    Direct,
    /// Connect through an HTTP proxy. Secure origins tunnel with CONNECT.
    Http {
        /// The proxy's hostname.
        host: String,
        /// The proxy's port.
        port: u16,
    },
}

impl Proxy {
    /// Whether this is a direct connection.
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("direct"),
            Proxy::Http { host, port } => write!(f, "proxy {host}:{port}"),
        }
    }
}

/// Chooses the proxies to attempt for an origin.
pub trait ProxySelector: Send + Sync + fmt::Debug {
    /// Proxies to attempt, in order. An empty result means direct.
    fn select(&self, host: &str, port: u16) -> Vec<Proxy>;

    /// A connect through `proxy` failed; future selections may avoid it.
    fn connect_failed(&self, host: &str, port: u16, proxy: &Proxy) {
        let _ = (host, port, proxy);
    }
}

/// A selector that never proxies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _host: &str, _port: u16) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// A proxy authentication challenge from a 407 response.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// The authentication scheme, e.g. `Basic`.
    pub scheme: String,
    /// The advertised realm, when present.
    pub realm: Option<String>,
}

/// Supplies credentials for proxy authentication challenges.
pub trait ProxyAuthenticator: Send + Sync + fmt::Debug {
    /// The `Proxy-Authorization` value answering `challenge`, or `None` to
    /// give up.
    fn authenticate(&self, proxy: &Proxy, challenge: &Challenge) -> Option<String>;
}

/// An authenticator with no credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProxyAuth;

impl ProxyAuthenticator for NoProxyAuth {
    fn authenticate(&self, _proxy: &Proxy, _challenge: &Challenge) -> Option<String> {
        None
    }
}

/// Trust material and identity checks for a secure origin.
#[derive(Debug, Clone)]
pub struct TlsMaterials {
    /// Trusted root certificates.
    pub roots: Arc<rustls::RootCertStore>,
    /// Hostname verification policy.
    pub verifier: Arc<dyn HostVerifier>,
    /// Certificate pinning policy.
    pub pinner: Arc<dyn CertificatePinner>,
}

impl TlsMaterials {
    fn same_as(&self, other: &TlsMaterials) -> bool {
        Arc::ptr_eq(&self.roots, &other.roots)
            && Arc::ptr_eq(&self.verifier, &other.verifier)
            && Arc::ptr_eq(&self.pinner, &other.pinner)
    }
}

// The default collaborators are process-wide singletons. Collaborators
// compare by instance identity, so handing every `Address::new` a fresh
// `Arc` would make independently built addresses route-incompatible.
fn default_dns() -> Arc<dyn Dns> {
    static DEFAULT: OnceLock<Arc<dyn Dns>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(SystemDns)).clone()
}

fn default_proxy_selector() -> Arc<dyn ProxySelector> {
    static DEFAULT: OnceLock<Arc<dyn ProxySelector>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(NoProxy)).clone()
}

fn default_proxy_auth() -> Arc<dyn ProxyAuthenticator> {
    static DEFAULT: OnceLock<Arc<dyn ProxyAuthenticator>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(NoProxyAuth)).clone()
}

/// The immutable identity of a target origin.
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    port: u16,
    dns: Arc<dyn Dns>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_auth: Arc<dyn ProxyAuthenticator>,
    proxy: Option<Proxy>,
    tls: Option<TlsMaterials>,
    protocols: Vec<Protocol>,
    tls_specs: Vec<TlsSpec>,
}

impl Address {
    /// An address for `host:port` with the system resolver, no proxy, no
    /// TLS, and the default TLS configuration ladder.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            dns: default_dns(),
            proxy_selector: default_proxy_selector(),
            proxy_auth: default_proxy_auth(),
            proxy: None,
            tls: None,
            protocols: vec![Protocol::Http11],
            tls_specs: vec![TlsSpec::modern_tls(), TlsSpec::cleartext()],
        }
    }

    /// Use a specific resolver.
    pub fn with_dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    /// Force a single proxy instead of consulting the proxy selector.
    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Use a specific proxy selector.
    pub fn with_proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = selector;
        self
    }

    /// Use a specific proxy authenticator.
    pub fn with_proxy_auth(mut self, auth: Arc<dyn ProxyAuthenticator>) -> Self {
        self.proxy_auth = auth;
        self
    }

    /// Make this a secure origin with the given trust material.
    pub fn with_tls(mut self, materials: TlsMaterials) -> Self {
        self.tls = Some(materials);
        self
    }

    /// The application protocols to offer, in preference order.
    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// The TLS configurations to attempt, in fallback order.
    pub fn with_tls_specs(mut self, specs: Vec<TlsSpec>) -> Self {
        self.tls_specs = specs;
        self
    }

    /// The origin hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The resolver for this origin.
    pub fn dns(&self) -> &Arc<dyn Dns> {
        &self.dns
    }

    /// The forced proxy, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// The proxy selector.
    pub fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }

    /// The proxy authenticator.
    pub fn proxy_auth(&self) -> &Arc<dyn ProxyAuthenticator> {
        &self.proxy_auth
    }

    /// Trust material, when this is a secure origin.
    pub fn tls(&self) -> Option<&TlsMaterials> {
        self.tls.as_ref()
    }

    /// Whether this origin uses TLS.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// The application protocols to offer.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// The TLS configurations to attempt, in fallback order.
    pub fn tls_specs(&self) -> &[TlsSpec] {
        &self.tls_specs
    }

    /// Whether `other` shares every field except the host.
    ///
    /// Collaborators (resolver, proxy machinery, verifier, pinner, roots)
    /// compare by instance identity. This is the precondition for routing
    /// two hostnames over the same connection.
    pub fn equals_non_host(&self, other: &Address) -> bool {
        self.port == other.port
            && Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && Arc::ptr_eq(&self.proxy_auth, &other.proxy_auth)
            && self.proxy == other.proxy
            && self.protocols == other.protocols
            && self.tls_specs == other.tls_specs
            && match (&self.tls, &other.tls) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same_as(b),
                _ => false,
            }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.proxy.hash(state);
        self.protocols.hash(state);
        self.tls_specs.hash(state);
        (Arc::as_ptr(&self.dns) as *const () as usize).hash(state);
        (Arc::as_ptr(&self.proxy_selector) as *const () as usize).hash(state);
        (Arc::as_ptr(&self.proxy_auth) as *const () as usize).hash(state);
        if let Some(tls) = &self.tls {
            (Arc::as_ptr(&tls.roots) as *const () as usize).hash(state);
            (Arc::as_ptr(&tls.verifier) as *const () as usize).hash(state);
            (Arc::as_ptr(&tls.pinner) as *const () as usize).hash(state);
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dns::StaticDns;

    #[test]
    fn equals_non_host_ignores_only_the_host() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new());
        let a = Address::new("one.example", 443).with_dns(dns.clone());
        let b = Address::new("two.example", 443).with_dns(dns.clone());

        assert!(a.equals_non_host(&b));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn default_collaborators_are_shared_across_addresses() {
        // Two addresses built without any customization must be
        // route-compatible, or coalescing could never trigger for them.
        let a = Address::new("one.example", 443);
        let b = Address::new("two.example", 443);

        assert!(a.equals_non_host(&b));
        assert!(Arc::ptr_eq(a.dns(), b.dns()));
    }

    #[test]
    fn equals_non_host_distinguishes_ports_and_collaborators() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new());
        let a = Address::new("one.example", 443).with_dns(dns.clone());

        let other_port = Address::new("one.example", 8443).with_dns(dns.clone());
        assert!(!a.equals_non_host(&other_port));

        // A different resolver instance breaks compatibility even when the
        // configuration is otherwise identical.
        let other_dns = Address::new("one.example", 443).with_dns(Arc::new(StaticDns::new()));
        assert!(!a.equals_non_host(&other_dns));
    }

    #[test]
    fn proxied_addresses_do_not_match_direct_ones() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new());
        let direct = Address::new("one.example", 80).with_dns(dns.clone());
        let proxied = Address::new("one.example", 80)
            .with_dns(dns.clone())
            .with_proxy(Proxy::Http {
                host: "proxy.example".into(),
                port: 3128,
            });

        assert!(!direct.equals_non_host(&proxied));
    }
}
