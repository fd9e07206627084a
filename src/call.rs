//! Per-call coordination.
//!
//! A [`Transmitter`] manages one logical call: it finds (or builds) the
//! connection, carries at most one [`Exchange`] at a time, and releases the
//! connection when the call is done. The connection search prefers the
//! call's bound connection, then the pool, then fresh routes, coalescing
//! onto an eligible pooled connection whenever one appears mid-search.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::Address;
use crate::body::{RequestBody, ResponseBody};
use crate::codec::{Codec, CodecFactory};
use crate::conn::{Connection, Io};
use crate::error::{ConnectError, Error, RouteError};
use crate::events::EventListener;
use crate::pool::{Acquired, Pool};
use crate::route::{Route, RouteSelector, Selection};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one logical call, for attachment tracking and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    /// A fresh identifier.
    pub fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Per-call timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct Options {
    /// Bound on each TCP connect.
    pub connect_timeout: Duration,
    /// Bound on reads during establishment (tunnel, handshake).
    pub read_timeout: Duration,
    /// Bound on writes during establishment.
    pub write_timeout: Duration,
    /// Bound on the whole call, when set.
    pub call_timeout: Option<Duration>,
    /// Keep-alive ping interval for multiplexed sessions.
    pub ping_interval: Option<Duration>,
    /// Whether connect failures walk the TLS fallback ladder.
    pub retry_on_connection_failure: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            call_timeout: None,
            ping_interval: None,
            retry_on_connection_failure: true,
        }
    }
}

#[derive(Debug)]
struct Finder {
    address: Arc<Address>,
    selector: RouteSelector,
    selection: Option<Selection>,
    next_route_to_try: Option<Route>,
    has_stream_failure: bool,
}

impl Finder {
    fn new(address: Arc<Address>, pool: &Pool, call: CallId, events: Arc<dyn EventListener>) -> Self {
        let selector = RouteSelector::new(address.clone(), pool.database().clone(), call, events);
        Self {
            address,
            selector,
            selection: None,
            next_route_to_try: None,
            has_stream_failure: false,
        }
    }

    /// Whether a retry could take a different path: a remembered route, the
    /// previous connection's still-good route, or untried candidates.
    fn has_route_to_try(&mut self, current: Option<&Connection>) -> bool {
        if self.next_route_to_try.is_some() {
            return true;
        }
        if let Some(connection) = current {
            if connection.route_failure_count() == 0
                && connection.route().address().host() == self.address.host()
            {
                self.next_route_to_try = Some(connection.route().clone());
                return true;
            }
        }
        self.selection.as_ref().is_some_and(|s| s.has_next()) || self.selector.has_next()
    }
}

#[derive(Debug, Default)]
struct TxState {
    address: Option<Arc<Address>>,
    finder: Option<Finder>,
    connection: Option<Arc<Connection>>,
    connecting: Option<Arc<Connection>>,
    codec: Option<Arc<dyn Codec>>,
    request_done: bool,
    response_done: bool,
    canceled: bool,
    no_more_exchanges: bool,
    finished: bool,
    timeout_early_exit: bool,
}

#[derive(Debug)]
struct Inner {
    pool: Pool,
    options: Options,
    events: Arc<dyn EventListener>,
    call: CallId,
    deadline: Option<Instant>,
    state: Mutex<TxState>,
}

/// Coordinates one logical call against the pool.
#[derive(Debug, Clone)]
pub struct Transmitter {
    inner: Arc<Inner>,
}

impl Transmitter {
    /// A transmitter for one call. The call's deadline, when configured,
    /// starts now.
    pub fn new(pool: Pool, options: Options, events: Arc<dyn EventListener>) -> Self {
        let call = CallId::next();
        let deadline = options.call_timeout.map(|timeout| Instant::now() + timeout);
        events.call_start(call);
        Self {
            inner: Arc::new(Inner {
                pool,
                options,
                events,
                call,
                deadline,
                state: Mutex::new(TxState::default()),
            }),
        }
    }

    /// This call's identifier.
    pub fn call(&self) -> CallId {
        self.inner.call
    }

    /// The connection currently bound to this call.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.state.lock().connection.clone()
    }

    /// Point this call at `address`.
    ///
    /// When the target is unchanged and a route remains worth trying, the
    /// search state is kept so a retry can pick up where it left off;
    /// otherwise any bound connection is released and the search restarts.
    pub fn prepare(&self, address: Arc<Address>) {
        let mut released = None;
        let mut io = None;
        {
            let mut state = self.inner.state.lock();
            if let Some(current) = &state.address {
                if **current == *address {
                    let connection = state.connection.clone();
                    if let Some(finder) = state.finder.as_mut() {
                        if finder.has_route_to_try(connection.as_deref()) {
                            return;
                        }
                    }
                }
                debug_assert!(state.codec.is_none(), "exchange still active");
                (released, io) = self.release_connection_locked(&mut state);
            }
            state.address = Some(address.clone());
            state.finder = Some(Finder::new(
                address,
                &self.inner.pool,
                self.inner.call,
                self.inner.events.clone(),
            ));
        }
        drop(io);
        if let Some(connection) = released {
            self.inner.events.connection_released(self.inner.call, &connection);
        }
    }

    /// Whether a retry of this call is worthwhile: the last failure was a
    /// stream failure, and another path remains.
    pub fn can_retry(&self) -> bool {
        let mut state = self.inner.state.lock();
        let connection = state.connection.clone();
        let Some(finder) = state.finder.as_mut() else {
            return false;
        };
        finder.has_stream_failure && finder.has_route_to_try(connection.as_deref())
    }

    /// Cancel the call. The active exchange's stream is torn down; a
    /// connection still being established is closed underneath the
    /// handshake.
    pub fn cancel(&self) {
        let (codec, connection) = {
            let mut state = self.inner.state.lock();
            state.canceled = true;
            (
                state.codec.clone(),
                state.connecting.clone().or_else(|| state.connection.clone()),
            )
        };
        if let Some(codec) = codec {
            codec.cancel();
        } else if let Some(connection) = connection {
            connection.cancel();
        }
    }

    /// Whether the call has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.state.lock().canceled
    }

    /// Exempt a long-lived exchange from the call deadline.
    pub fn timeout_early_exit(&self) {
        self.inner.state.lock().timeout_early_exit = true;
    }

    /// Declare the call finished and release its resources.
    ///
    /// `error` is the call's outcome so far; if the call deadline elapsed it
    /// is converted into the distinguished timeout error.
    pub fn no_more_exchanges(&self, error: Option<Error>) -> Option<Error> {
        let released;
        let io;
        let call_done;
        let result;
        {
            let mut state = self.inner.state.lock();
            state.no_more_exchanges = true;
            (released, io, call_done, result) = self.maybe_release_locked(&mut state, error);
        }
        drop(io);
        self.report(released, call_done, result)
    }

    /// Find a healthy connection and bind a codec for one exchange.
    pub async fn new_exchange(
        &self,
        factory: &dyn CodecFactory,
        extensive_health_checks: bool,
    ) -> Result<Exchange, Error> {
        let mut finder = {
            let mut state = self.inner.state.lock();
            if state.canceled {
                return Err(Error::Canceled);
            }
            if state.no_more_exchanges {
                return Err(Error::State("this call may not make new exchanges"));
            }
            if state.codec.is_some() {
                return Err(Error::State("a previous exchange is still active"));
            }
            state
                .finder
                .take()
                .ok_or(Error::State("call not prepared"))?
        };

        let result = match self.remaining_deadline() {
            Some(remaining) => {
                match tokio::time::timeout(remaining, self.find_healthy(&mut finder, extensive_health_checks)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout { source: None }),
                }
            }
            None => self.find_healthy(&mut finder, extensive_health_checks).await,
        };

        let connection = {
            let mut state = self.inner.state.lock();
            state.connecting = None;
            match result {
                Ok(connection) => {
                    state.finder = Some(finder);
                    connection
                }
                Err(error) => {
                    finder.has_stream_failure = true;
                    state.finder = Some(finder);
                    return Err(error);
                }
            }
        };

        let codec = factory.bind(&connection);
        let core = Arc::new(ExchangeCore {
            transmitter: self.clone(),
            connection: connection.clone(),
            request_complete: AtomicBool::new(false),
            response_complete: AtomicBool::new(false),
        });
        {
            let mut state = self.inner.state.lock();
            state.codec = Some(codec.clone());
            state.request_done = false;
            state.response_done = false;
        }
        Ok(Exchange { core, codec })
    }

    fn remaining_deadline(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    async fn find_healthy(
        &self,
        finder: &mut Finder,
        extensive: bool,
    ) -> Result<Arc<Connection>, Error> {
        loop {
            let candidate = self.find(finder).await?;
            if candidate.is_brand_new() {
                return Ok(candidate);
            }
            if !candidate.is_healthy(extensive).await {
                tracing::debug!(id = %candidate.id(), "pooled connection unhealthy, retiring");
                candidate.retire();
                continue;
            }
            return Ok(candidate);
        }
    }

    /// The four-step connection search: the call's own connection, the pool,
    /// a fresh route (re-checking the pool once routes are known, for
    /// coalescing), and finally a new connection, with a last post-handshake
    /// coalescing check that discards the losing socket.
    async fn find(&self, finder: &mut Finder) -> Result<Arc<Connection>, Error> {
        let call = self.inner.call;
        let events = &self.inner.events;
        let pool = &self.inner.pool;

        let mut selected_route: Option<Route> = None;
        let mut result: Option<Arc<Connection>> = None;
        let mut from_pool = false;
        let mut busy: Option<Arc<Connection>> = None;
        let released;
        let released_io;
        {
            let mut state = self.inner.state.lock();
            if state.canceled {
                return Err(Error::Canceled);
            }
            finder.has_stream_failure = false;

            if let Some(connection) = state.connection.clone() {
                if connection.no_new_exchanges() {
                    (released, released_io) = self.release_connection_locked(&mut state);
                } else {
                    result = Some(connection);
                    released = None;
                    released_io = None;
                }
            } else {
                released = None;
                released_io = None;
            }

            if result.is_none() {
                match pool.acquire(finder.address.as_ref(), call, None, false) {
                    Acquired::Hit(connection) => {
                        state.connection = Some(connection.clone());
                        result = Some(connection);
                        from_pool = true;
                    }
                    Acquired::Busy(connection) => busy = Some(connection),
                    Acquired::Miss => {}
                }
                if result.is_none() {
                    if let Some(route) = finder.next_route_to_try.take() {
                        selected_route = Some(route);
                    } else if let Some(previous) = &released {
                        // The route we just used may still be good even though
                        // the connection is not.
                        if previous.route_failure_count() == 0
                            && previous.route().address().host() == finder.address.host()
                        {
                            selected_route = Some(previous.route().clone());
                        }
                    }
                }
            }
        }
        drop(released_io);
        if let Some(connection) = &released {
            events.connection_released(call, connection);
        }
        if let Some(connection) = result {
            if from_pool {
                events.connection_acquired(call, &connection);
            }
            return Ok(connection);
        }

        // A same-origin multiplexed session is at capacity: wait (bounded)
        // for a slot instead of dialing a competing connection.
        if let Some(busy) = busy {
            tracing::trace!(id = %busy.id(), "waiting for a stream slot");
            let _ = tokio::time::timeout(self.inner.options.connect_timeout, busy.slot_freed())
                .await;
            let mut state = self.inner.state.lock();
            if state.canceled {
                return Err(Error::Canceled);
            }
            if let Acquired::Hit(connection) =
                pool.acquire(finder.address.as_ref(), call, None, false)
            {
                state.connection = Some(connection.clone());
                drop(state);
                events.connection_acquired(call, &connection);
                return Ok(connection);
            }
        }

        // Route selection may block on DNS.
        let mut new_selection = false;
        if selected_route.is_none()
            && !finder.selection.as_ref().is_some_and(|s| s.has_next())
        {
            let selection = finder
                .selector
                .next()
                .await
                .map_err(|error| Error::Route(RouteError::new(error)))?;
            finder.selection = Some(selection);
            new_selection = true;
        }

        let mut routes_hint: Option<Vec<Route>> = None;
        let connection;
        let route;
        {
            let mut state = self.inner.state.lock();
            if state.canceled {
                return Err(Error::Canceled);
            }

            if new_selection {
                // With resolved addresses in hand, the pool may hold a
                // connection another host coalesces onto.
                let routes = finder.selection.as_ref().map(|s| s.all().to_vec()).unwrap_or_default();
                routes_hint = Some(routes);
                if let Acquired::Hit(found) =
                    pool.acquire(finder.address.as_ref(), call, routes_hint.as_deref(), false)
                {
                    state.connection = Some(found.clone());
                    drop(state);
                    events.connection_acquired(call, &found);
                    return Ok(found);
                }
            }

            route = match selected_route {
                Some(route) => route,
                None => finder
                    .selection
                    .as_mut()
                    .and_then(|s| s.next())
                    .ok_or(Error::Route(RouteError::new(ConnectError::RoutesExhausted)))?,
            };
            connection = Connection::new(route.clone());
            state.connecting = Some(connection.clone());
        }

        // TCP + tunnel + TLS, outside all locks.
        let connected = connection
            .connect(&self.inner.options, call, events.as_ref())
            .await;
        {
            let mut state = self.inner.state.lock();
            state.connecting = None;
        }
        if let Err(route_error) = connected {
            finder.selector.connect_failed(&route);
            return Err(Error::Route(route_error));
        }
        pool.database().connected(connection.route());

        // Last coalescing check: if a concurrent call just pooled an
        // equivalent multiplexed connection, ours lost the race.
        let mut lost_io = None;
        let winner = {
            let mut state = self.inner.state.lock();
            match pool.acquire(finder.address.as_ref(), call, routes_hint.as_deref(), true) {
                Acquired::Hit(existing) => {
                    tracing::debug!(loser = %connection.id(), winner = %existing.id(), "lost the coalescing race");
                    connection.retire();
                    lost_io = connection.close();
                    // If the winner turns out unhealthy, the route that just
                    // worked is the best next candidate.
                    finder.next_route_to_try = Some(route);
                    state.connection = Some(existing.clone());
                    existing
                }
                _ => {
                    pool.put(connection.clone(), call);
                    state.connection = Some(connection.clone());
                    connection
                }
            }
        };
        drop(lost_io);
        events.connection_acquired(call, &winner);
        Ok(winner)
    }

    fn release_connection_locked(
        &self,
        state: &mut TxState,
    ) -> (Option<Arc<Connection>>, Option<Io>) {
        let Some(connection) = state.connection.take() else {
            return (None, None);
        };
        let io = self.inner.pool.release(&connection, self.inner.call);
        (Some(connection), io)
    }

    fn maybe_release_locked(
        &self,
        state: &mut TxState,
        error: Option<Error>,
    ) -> (Option<Arc<Connection>>, Option<Io>, bool, Option<Error>) {
        let mut released = None;
        let mut io = None;
        let exchange_active = state.codec.is_some();
        if state.connection.is_some() && !exchange_active && state.no_more_exchanges {
            (released, io) = self.release_connection_locked(state);
        }
        let call_done = state.no_more_exchanges && !exchange_active && !state.finished;
        let error = if call_done {
            state.finished = true;
            self.apply_deadline(state, error)
        } else {
            error
        };
        (released, io, call_done, error)
    }

    fn apply_deadline(&self, state: &TxState, error: Option<Error>) -> Option<Error> {
        let Some(deadline) = self.inner.deadline else {
            return error;
        };
        if state.timeout_early_exit || Instant::now() < deadline {
            return error;
        }
        Some(Error::Timeout {
            source: error.map(Box::new),
        })
    }

    fn report(
        &self,
        released: Option<Arc<Connection>>,
        call_done: bool,
        result: Option<Error>,
    ) -> Option<Error> {
        if let Some(connection) = released {
            self.inner.events.connection_released(self.inner.call, &connection);
        }
        if call_done {
            match &result {
                Some(error) => self.inner.events.call_failed(self.inner.call, error),
                None => self.inner.events.call_end(self.inner.call),
            }
        }
        result
    }

    pub(crate) fn exchange_failed(&self, error: &Error) {
        let connection = self.inner.state.lock().connection.clone();
        if let Some(connection) = connection {
            connection.track_failure(self.inner.pool.database(), error);
        }
        let mut state = self.inner.state.lock();
        if let Some(finder) = state.finder.as_mut() {
            finder.has_stream_failure = true;
        }
    }

    pub(crate) fn exchange_message_done(
        &self,
        error: Option<Error>,
        request_done: bool,
        response_done: bool,
    ) -> Option<Error> {
        let released;
        let io;
        let call_done;
        let result;
        {
            let mut state = self.inner.state.lock();
            if state.codec.is_none() {
                return error;
            }
            let mut changed = false;
            if request_done && !state.request_done {
                state.request_done = true;
                changed = true;
            }
            if response_done && !state.response_done {
                state.response_done = true;
                changed = true;
            }
            if !changed {
                return error;
            }
            if state.request_done && state.response_done {
                state.codec = None;
                if let Some(connection) = &state.connection {
                    connection.increment_success();
                }
            }
            (released, io, call_done, result) = self.maybe_release_locked(&mut state, error);
        }
        drop(io);
        self.report(released, call_done, result)
    }
}

/// Shared state between an exchange and its body wrappers.
#[derive(Debug)]
pub(crate) struct ExchangeCore {
    transmitter: Transmitter,
    connection: Arc<Connection>,
    request_complete: AtomicBool,
    response_complete: AtomicBool,
}

impl ExchangeCore {
    /// Complete the request direction. Idempotent; only the first caller
    /// has any effect.
    pub(crate) fn complete_request(&self, bytes: u64, error: Option<Error>) -> Option<Error> {
        if self.request_complete.swap(true, Ordering::SeqCst) {
            return error;
        }
        let call = self.transmitter.inner.call;
        match &error {
            Some(e) => {
                self.transmitter.inner.events.request_failed(call, e);
                self.transmitter.exchange_failed(e);
            }
            None => self.transmitter.inner.events.request_body_end(call, bytes),
        }
        self.transmitter.exchange_message_done(error, true, false)
    }

    /// Complete the response direction. Idempotent.
    pub(crate) fn complete_response(&self, bytes: u64, error: Option<Error>) -> Option<Error> {
        if self.response_complete.swap(true, Ordering::SeqCst) {
            return error;
        }
        let call = self.transmitter.inner.call;
        match &error {
            Some(e) => {
                self.transmitter.inner.events.response_failed(call, e);
                self.transmitter.exchange_failed(e);
            }
            None => self.transmitter.inner.events.response_body_end(call, bytes),
        }
        self.transmitter.exchange_message_done(error, false, true)
    }
}

/// One request/response pair over a connection.
#[derive(Debug)]
pub struct Exchange {
    core: Arc<ExchangeCore>,
    codec: Arc<dyn Codec>,
}

impl Exchange {
    /// The connection hosting this exchange.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.core.connection
    }

    /// The bound wire codec.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Wrap the codec's request sink with framing enforcement and
    /// completion accounting.
    pub fn request_body<W: AsyncWrite>(&self, inner: W, content_length: Option<u64>) -> RequestBody<W> {
        self.core
            .transmitter
            .inner
            .events
            .request_body_start(self.core.transmitter.inner.call);
        RequestBody::new(inner, self.core.clone(), content_length)
    }

    /// Wrap the codec's response source with framing enforcement and
    /// completion accounting.
    pub fn response_body<R: AsyncRead>(&self, inner: R, content_length: Option<u64>) -> ResponseBody<R> {
        self.core
            .transmitter
            .inner
            .events
            .response_body_start(self.core.transmitter.inner.call);
        ResponseBody::new(inner, self.core.clone(), content_length)
    }

    /// This exchange carries no request body; the request direction is
    /// complete.
    pub fn no_request_body(&self) {
        let _ = self.core.complete_request(0, None);
    }

    /// Cancel the exchange's stream.
    pub fn cancel(&self) {
        self.codec.cancel();
    }

    /// Abandon the exchange: cancel the stream and force both directions
    /// complete.
    pub fn detach(&self) {
        self.codec.cancel();
        let _ = self.core.complete_request(0, Some(Error::Canceled));
        let _ = self.core.complete_response(0, Some(Error::Canceled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use static_assertions::assert_impl_all;
    use tokio::io::AsyncReadExt;

    use crate::address::Protocol;
    use crate::conn::test_support;
    use crate::dns::{Dns, StaticDns};
    use crate::events::{EventListener, NoEvents};
    use crate::pool::PoolConfig;
    use crate::route::Route;

    assert_impl_all!(Transmitter: Send, Sync, Clone);
    assert_impl_all!(Exchange: Send, Sync);

    #[derive(Debug)]
    struct NoopCodec;

    impl Codec for NoopCodec {
        fn cancel(&self) {}
    }

    #[derive(Debug)]
    struct NoopFactory;

    impl CodecFactory for NoopFactory {
        fn bind(&self, _connection: &Arc<Connection>) -> Arc<dyn Codec> {
            Arc::new(NoopCodec)
        }
    }

    async fn loopback() -> (tokio::net::TcpListener, std::net::SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn loopback_address(host: &str, port: u16) -> Arc<Address> {
        let dns: Arc<dyn Dns> =
            Arc::new(StaticDns::new().with(host, [IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        Arc::new(Address::new(host, port).with_dns(dns))
    }

    fn transmitter(pool: &Pool, options: Options) -> Transmitter {
        Transmitter::new(pool.clone(), options, Arc::new(NoEvents))
    }

    async fn finish_exchange(exchange: &Exchange) {
        exchange.no_request_body();
        let mut body = exchange.response_body(tokio::io::empty(), None);
        let mut sink = Vec::new();
        body.read_to_end(&mut sink).await.unwrap();
    }

    #[tokio::test]
    async fn new_exchange_requires_prepare() {
        let pool = Pool::new(PoolConfig::default());
        let tx = transmitter(&pool, Options::default());
        let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
        assert!(matches!(error, Error::State(_)));
    }

    #[tokio::test]
    async fn connects_pools_and_reuses() {
        let (listener, addr) = loopback().await;
        tokio::spawn(async move {
            loop {
                let Ok((_socket, _)) = listener.accept().await else { break };
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", addr.port());

        let tx1 = transmitter(&pool, Options::default());
        tx1.prepare(address.clone());
        let exchange = tx1.new_exchange(&NoopFactory, true).await.unwrap();
        let first_id = exchange.connection().id();
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        finish_exchange(&exchange).await;
        assert!(tx1.no_more_exchanges(None).is_none());
        assert_eq!(pool.idle_count(), 1);

        // A second call picks up the pooled connection instead of dialing.
        let tx2 = transmitter(&pool, Options::default());
        tx2.prepare(address);
        let exchange = tx2.new_exchange(&NoopFactory, true).await.unwrap();
        assert_eq!(exchange.connection().id(), first_id);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn one_exchange_at_a_time() {
        let (listener, addr) = loopback().await;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", addr.port());
        let tx = transmitter(&pool, Options::default());
        tx.prepare(address);

        let _exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
        let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
        assert!(matches!(error, Error::State(_)));
    }

    #[tokio::test]
    async fn canceled_calls_do_not_connect() {
        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", 80);
        let tx = transmitter(&pool, Options::default());
        tx.prepare(address);
        tx.cancel();
        assert!(tx.is_canceled());
        let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
        assert!(matches!(error, Error::Canceled));
    }

    #[tokio::test]
    async fn dns_failures_surface_as_route_errors() {
        let pool = Pool::new(PoolConfig::default());
        let dns: Arc<dyn Dns> = Arc::new(StaticDns::new());
        let address = Arc::new(Address::new("missing.example", 80).with_dns(dns));
        let tx = transmitter(&pool, Options::default());
        tx.prepare(address);

        let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
        match error {
            Error::Route(route_error) => {
                assert!(matches!(route_error.first(), ConnectError::Dns { .. }))
            }
            other => panic!("expected route error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_call_deadline_produces_the_distinguished_timeout() {
        let pool = Pool::new(PoolConfig::default());
        // A blackhole address: the TCP connect will out-wait the call.
        let dns: Arc<dyn Dns> = Arc::new(
            StaticDns::new().with("slow.example", [IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1))]),
        );
        let address = Arc::new(Address::new("slow.example", 81).with_dns(dns));

        let tx = transmitter(
            &pool,
            Options {
                call_timeout: Some(Duration::from_millis(100)),
                ..Options::default()
            },
        );
        tx.prepare(address);

        let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
        assert!(error.is_timeout());
    }

    #[tokio::test]
    async fn a_third_call_waits_for_a_stream_slot() {
        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", 80);
        let route = Route::new(
            address.clone(),
            crate::address::Proxy::Direct,
            std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 80),
        );
        let connection = test_support::ready(route, Protocol::H2);
        test_support::set_stream_limit(&connection, 2);
        let seed = CallId::next();
        pool.put(connection.clone(), seed);
        let _ = pool.release(&connection, seed);

        let tx1 = transmitter(&pool, Options::default());
        tx1.prepare(address.clone());
        let e1 = tx1.new_exchange(&NoopFactory, true).await.unwrap();

        let tx2 = transmitter(&pool, Options::default());
        tx2.prepare(address.clone());
        let e2 = tx2.new_exchange(&NoopFactory, true).await.unwrap();
        assert_eq!(e1.connection().id(), e2.connection().id());

        // Both slots are taken; the third call must block until one frees.
        let tx3 = transmitter(&pool, Options::default());
        tx3.prepare(address.clone());
        let third = tokio::spawn(async move {
            let exchange = tx3.new_exchange(&NoopFactory, true).await.unwrap();
            exchange.connection().id()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        finish_exchange(&e1).await;
        assert!(tx1.no_more_exchanges(None).is_none());

        let third_id = tokio::time::timeout(Duration::from_secs(5), third)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third_id, connection.id());
        assert_eq!(pool.connection_count(), 1);
    }

    /// Pools an equivalent multiplexed connection the moment a dial starts,
    /// so the dialing call loses the coalescing race.
    #[derive(Debug)]
    struct RivalConnect {
        pool: Pool,
        rival: Arc<Connection>,
        planted: AtomicBool,
    }

    impl EventListener for RivalConnect {
        fn connect_start(&self, _call: CallId, _route: &Route) {
            if !self.planted.swap(true, Ordering::SeqCst) {
                let seed = CallId::next();
                self.pool.put(self.rival.clone(), seed);
                let _ = self.pool.release(&self.rival, seed);
            }
        }
    }

    #[tokio::test]
    async fn losing_the_coalescing_race_keeps_the_pooled_connection() {
        let (listener, addr) = loopback().await;
        tokio::spawn(async move {
            loop {
                let Ok((_socket, _)) = listener.accept().await else { break };
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", addr.port());
        let route = Route::new(
            address.clone(),
            crate::address::Proxy::Direct,
            std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        );
        let rival = test_support::ready(route, Protocol::H2);

        let events = Arc::new(RivalConnect {
            pool: pool.clone(),
            rival: rival.clone(),
            planted: AtomicBool::new(false),
        });
        let tx = Transmitter::new(pool.clone(), Options::default(), events);
        tx.prepare(address);

        // The pool is empty when the search starts, so the call dials; by
        // the time the socket is up the rival is pooled and wins.
        let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
        assert_eq!(exchange.connection().id(), rival.id());
        assert_eq!(pool.connection_count(), 1);

        // The freshly dialed route survives as the next candidate in case
        // the winner goes bad.
        let state = tx.inner.state.lock();
        assert!(state.finder.as_ref().unwrap().next_route_to_try.is_some());
    }

    #[tokio::test]
    async fn retired_bound_connections_are_replaced() {
        let (listener, addr) = loopback().await;
        tokio::spawn(async move {
            loop {
                let Ok((_socket, _)) = listener.accept().await else { break };
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", addr.port());
        let tx = transmitter(&pool, Options::default());
        tx.prepare(address);

        let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
        let first_id = exchange.connection().id();
        exchange.connection().retire();
        finish_exchange(&exchange).await;

        // The retired connection is released and a fresh one dialed.
        let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
        assert_ne!(exchange.connection().id(), first_id);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn stream_failures_enable_retry_when_routes_remain() {
        let (listener, addr) = loopback().await;
        tokio::spawn(async move {
            loop {
                let Ok((_socket, _)) = listener.accept().await else { break };
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let pool = Pool::new(PoolConfig::default());
        let address = loopback_address("one.example", addr.port());
        let tx = transmitter(&pool, Options::default());
        tx.prepare(address);

        let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
        assert!(!tx.can_retry());

        // A refused stream marks the attempt retryable; the just-used route
        // is still good.
        let error = exchange
            .core
            .complete_request(0, Some(Error::Stream(crate::error::StreamError::Refused)));
        assert!(error.is_some());
        assert!(tx.can_retry());
    }
}
