//! DNS resolution.
//!
//! The crate ships the system resolver and a static table resolver; anything
//! smarter plugs in through the [`Dns`] trait.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::pin::Pin;

/// Future returned by [`Dns::lookup`].
pub type Resolved = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send>>;

/// Resolves hostnames to candidate IP addresses.
///
/// An empty result is an error: implementations should return an
/// unknown-host error rather than an empty list.
pub trait Dns: Send + Sync + fmt::Debug {
    /// Resolve `host` to its addresses, in preference order.
    fn lookup(&self, host: &str) -> Resolved;
}

fn unknown_host(host: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}"))
}

/// The system resolver, running `getaddrinfo` on the blocking thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, host: &str) -> Resolved {
        let host = host.to_owned();
        Box::pin(async move {
            tracing::trace!(host = %host, "resolving");
            let name = host.clone();
            let addresses = tokio::task::spawn_blocking(move || {
                (name.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<_>>())
            })
            .await
            .map_err(|error| io::Error::new(io::ErrorKind::Interrupted, error))??;

            if addresses.is_empty() {
                return Err(unknown_host(&host));
            }
            tracing::trace!(host = %host, count = addresses.len(), "resolved");
            Ok(addresses)
        })
    }
}

/// A fixed host table. Hosts not in the table resolve to an unknown-host
/// error.
#[derive(Debug, Clone, Default)]
pub struct StaticDns {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticDns {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses for `host`.
    pub fn with(mut self, host: &str, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.entries
            .entry(host.to_owned())
            .or_default()
            .extend(addresses);
        self
    }
}

impl Dns for StaticDns {
    fn lookup(&self, host: &str) -> Resolved {
        let result = match self.entries.get(host) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses.clone()),
            _ => Err(unknown_host(host)),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn static_table_resolves_known_hosts() {
        let dns = StaticDns::new().with(
            "example.com",
            [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
        );

        let addresses = dns.lookup("example.com").await.unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0], IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn static_table_rejects_unknown_hosts() {
        let dns = StaticDns::new();
        let error = dns.lookup("missing.example").await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn system_resolver_handles_localhost() {
        let addresses = SystemDns.lookup("localhost").await.unwrap();
        assert!(addresses.iter().any(|addr| addr.is_loopback()));
    }
}
