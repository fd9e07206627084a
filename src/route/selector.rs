//! Route iteration: proxies, DNS, and postponed last resorts.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::address::{Address, Proxy};
use crate::call::CallId;
use crate::error::ConnectError;
use crate::events::EventListener;
use crate::route::{Route, RouteDatabase};

/// Yields batches of candidate routes for one origin.
///
/// Each batch covers one proxy: the proxy's target hostname is resolved and
/// every resulting address becomes a route. Routes the [`RouteDatabase`]
/// remembers as failed are held back and returned as a final batch once
/// everything else has been tried.
#[derive(Debug)]
pub struct RouteSelector {
    address: Arc<Address>,
    database: Arc<RouteDatabase>,
    call: CallId,
    events: Arc<dyn EventListener>,
    proxies: Vec<Proxy>,
    next_proxy: usize,
    postponed: Vec<Route>,
}

impl RouteSelector {
    /// A selector for `address`, consulting `database` for postponement.
    pub fn new(
        address: Arc<Address>,
        database: Arc<RouteDatabase>,
        call: CallId,
        events: Arc<dyn EventListener>,
    ) -> Self {
        let mut proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => address.proxy_selector().select(address.host(), address.port()),
        };
        if proxies.is_empty() {
            proxies.push(Proxy::Direct);
        }
        Self {
            address,
            database,
            call,
            events,
            proxies,
            next_proxy: 0,
            postponed: Vec::new(),
        }
    }

    /// Whether another batch of routes remains.
    pub fn has_next(&self) -> bool {
        self.next_proxy < self.proxies.len() || !self.postponed.is_empty()
    }

    /// Resolve the next batch of routes.
    ///
    /// Resolution errors surface immediately; an exhausted selector returns
    /// [`ConnectError::RoutesExhausted`].
    pub async fn next(&mut self) -> Result<Selection, ConnectError> {
        let mut routes = Vec::new();

        while self.next_proxy < self.proxies.len() {
            let proxy = self.proxies[self.next_proxy].clone();
            self.next_proxy += 1;

            let (host, port) = match &proxy {
                Proxy::Direct => (self.address.host().to_owned(), self.address.port()),
                Proxy::Http { host, port } => (host.clone(), *port),
            };

            self.events.dns_start(self.call, &host);
            let addresses = self
                .address
                .dns()
                .lookup(&host)
                .await
                .map_err(|source| ConnectError::Dns {
                    host: host.clone(),
                    source,
                })?;
            if addresses.is_empty() {
                return Err(ConnectError::Dns {
                    host: host.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("unknown host {host}"),
                    ),
                });
            }
            self.events.dns_end(self.call, &host, &addresses);

            for ip in addresses {
                let route = Route::new(
                    self.address.clone(),
                    proxy.clone(),
                    SocketAddr::new(ip, port),
                );
                if self.database.should_postpone(&route) {
                    self.postponed.push(route);
                } else {
                    routes.push(route);
                }
            }

            if !routes.is_empty() {
                break;
            }
        }

        if routes.is_empty() {
            // Every fresh candidate was postponed; the failed routes are the
            // last resort.
            routes = std::mem::take(&mut self.postponed);
        }
        if routes.is_empty() {
            return Err(ConnectError::RoutesExhausted);
        }

        tracing::trace!(count = routes.len(), "selected route batch");
        Ok(Selection::new(routes))
    }

    /// Report that connecting over `route` failed.
    pub fn connect_failed(&self, route: &Route) {
        if !route.proxy().is_direct() {
            self.address.proxy_selector().connect_failed(
                self.address.host(),
                self.address.port(),
                route.proxy(),
            );
        }
        self.database.failed(route);
    }
}

/// One batch of routes, iterated in order.
#[derive(Debug)]
pub struct Selection {
    routes: Vec<Route>,
    index: usize,
}

impl Selection {
    fn new(routes: Vec<Route>) -> Self {
        Self { routes, index: 0 }
    }

    /// Whether another route remains in this batch.
    pub fn has_next(&self) -> bool {
        self.index < self.routes.len()
    }

    /// The next route in this batch.
    pub fn next(&mut self) -> Option<Route> {
        let route = self.routes.get(self.index).cloned()?;
        self.index += 1;
        Some(route)
    }

    /// Every route in this batch, including already-consumed ones.
    pub fn all(&self) -> &[Route] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use crate::dns::{Dns, StaticDns};
    use crate::events::NoEvents;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn selector(address: Address, database: Arc<RouteDatabase>) -> RouteSelector {
        RouteSelector::new(
            Arc::new(address),
            database,
            CallId::next(),
            Arc::new(NoEvents),
        )
    }

    #[tokio::test]
    async fn yields_one_route_per_resolved_address() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new().with("one.example", [ip(1), ip(2)]));
        let address = Address::new("one.example", 80).with_dns(dns);
        let mut selector = selector(address, Arc::new(RouteDatabase::new()));

        assert!(selector.has_next());
        let mut selection = selector.next().await.unwrap();
        assert_eq!(selection.all().len(), 2);

        let first = selection.next().unwrap();
        assert_eq!(first.socket_addr(), SocketAddr::new(ip(1), 80));
        assert!(selection.has_next());
        let second = selection.next().unwrap();
        assert_eq!(second.socket_addr(), SocketAddr::new(ip(2), 80));
        assert!(!selection.has_next());

        assert!(!selector.has_next());
        assert!(matches!(
            selector.next().await,
            Err(ConnectError::RoutesExhausted)
        ));
    }

    #[tokio::test]
    async fn failed_routes_come_back_as_a_last_resort_batch() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new().with("one.example", [ip(1), ip(2)]));
        let database = Arc::new(RouteDatabase::new());
        let address = Arc::new(Address::new("one.example", 80).with_dns(dns));

        let bad = Route::new(address.clone(), Proxy::Direct, SocketAddr::new(ip(1), 80));
        database.failed(&bad);

        let mut selector = RouteSelector::new(
            address,
            database,
            CallId::next(),
            Arc::new(NoEvents),
        );

        // Fresh batch skips the failed route.
        let fresh = selector.next().await.unwrap();
        assert_eq!(fresh.all().len(), 1);
        assert_eq!(fresh.all()[0].socket_addr(), SocketAddr::new(ip(2), 80));

        // The postponed route comes back once everything else is exhausted.
        assert!(selector.has_next());
        let last_resort = selector.next().await.unwrap();
        assert_eq!(last_resort.all().len(), 1);
        assert_eq!(last_resort.all()[0].socket_addr(), SocketAddr::new(ip(1), 80));
        assert!(!selector.has_next());
    }

    #[tokio::test]
    async fn proxied_selection_resolves_the_proxy_host() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new().with("proxy.example", [ip(9)]));
        let address = Address::new("one.example", 443)
            .with_dns(dns)
            .with_proxy(Proxy::Http {
                host: "proxy.example".into(),
                port: 3128,
            });
        let mut selector = selector(address, Arc::new(RouteDatabase::new()));

        let selection = selector.next().await.unwrap();
        assert_eq!(selection.all().len(), 1);
        let route = &selection.all()[0];
        assert_eq!(route.socket_addr(), SocketAddr::new(ip(9), 3128));
        assert!(!route.proxy().is_direct());
    }

    #[tokio::test]
    async fn unknown_hosts_surface_as_dns_errors() {
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new());
        let address = Address::new("missing.example", 80).with_dns(dns);
        let mut selector = selector(address, Arc::new(RouteDatabase::new()));

        match selector.next().await {
            Err(ConnectError::Dns { host, .. }) => assert_eq!(host, "missing.example"),
            other => panic!("expected dns error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failed_records_the_route() {
        let database = Arc::new(RouteDatabase::new());
        let address = Arc::new(Address::new("one.example", 80));
        let route = Route::new(address.clone(), Proxy::Direct, SocketAddr::new(ip(1), 80));

        let selector = RouteSelector::new(
            address,
            database.clone(),
            CallId::next(),
            Arc::new(NoEvents),
        );
        selector.connect_failed(&route);
        assert!(database.should_postpone(&route));
    }
}
