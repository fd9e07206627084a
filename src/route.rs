//! Routes: concrete paths to an origin.
//!
//! A [`Route`] pins down one way to reach an [`Address`]: which proxy to use
//! and which resolved socket address to dial. The [`RouteDatabase`] is the
//! crate-wide blacklist of routes that recently failed, used to try better
//! candidates first.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, Proxy};

pub mod selector;

pub use self::selector::{RouteSelector, Selection};

/// A single concrete path to an origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Arc<Address>,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Arc<Address>, proxy: Proxy, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            proxy,
            socket_addr,
        }
    }

    /// The origin this route reaches.
    pub fn address(&self) -> &Arc<Address> {
        &self.address
    }

    /// The proxy used by this route.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The resolved address to dial: the origin's for direct routes, the
    /// proxy's otherwise.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Whether establishing this route requires a CONNECT tunnel.
    ///
    /// That is the case for secure origins reached through an HTTP proxy.
    pub fn requires_tunnel(&self) -> bool {
        !self.proxy.is_direct() && self.address.is_secure()
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {} ({})", self.address, self.proxy, self.socket_addr)
    }
}

/// Remembers routes that recently failed.
///
/// Failed routes are attempted last when building new connections. An entry
/// is cleared only by a successful connect to the same route; there is no
/// time-based expiry.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that connecting over `route` failed.
    pub fn failed(&self, route: &Route) {
        tracing::trace!(route = %route, "route failed");
        self.failed.lock().insert(route.clone());
    }

    /// Record that connecting over `route` succeeded, clearing any failure.
    pub fn connected(&self, route: &Route) {
        self.failed.lock().remove(route);
    }

    /// Whether `route` should be deferred behind untried routes.
    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(route)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.failed.lock().len()
    }
}
