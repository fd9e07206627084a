//! Physical connections.
//!
//! A [`Connection`] owns one transport to an origin: TCP, optionally
//! tunneled through a proxy, optionally wrapped in TLS. It tracks which
//! calls are attached, how many exchanges succeeded, and whether it can host
//! new exchanges at all. Establishment follows a fixed sequence with
//! per-stage phases; failures walk the TLS fallback ladder before giving up
//! on the route.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;

use crate::address::{Address, Protocol};
use crate::call::{CallId, Options};
use crate::error::{ConnectError, Error, RouteError, StreamError, TlsError};
use crate::events::EventListener;
use crate::route::{Route, RouteDatabase};
use crate::secure::Handshake;
use crate::tls::{self, SocketCapabilities, SpecSelector, TlsVersion};

pub mod session;
pub(crate) mod tunnel;

pub use self::session::Session;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one physical connection, for logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle phase of a connection.
///
/// Phases only move forward, except that a failed establishment attempt
/// returns to `Connecting` for the next TLS fallback attempt. Once
/// `NoNewExchanges` is reached the connection can never host another
/// exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Created, not yet dialing.
    Idle,
    /// Dialing TCP.
    Connecting,
    /// Negotiating a CONNECT tunnel through a proxy.
    TunnelNegotiating,
    /// Running the TLS handshake.
    HandshakingTls,
    /// Transport up, protocol decided, not yet serving.
    ProtocolEstablished,
    /// Serving exchanges.
    Ready,
    /// Draining: existing exchanges may finish, no new ones start.
    NoNewExchanges,
    /// Closed; the socket is gone.
    Closed,
}

/// The transport under a connection.
#[derive(Debug)]
pub enum Io {
    /// A plain TCP stream.
    Plain(TcpStream),
    /// A TLS stream over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Io {
    fn tcp(&self) -> &TcpStream {
        match self {
            Io::Plain(stream) => stream,
            Io::Tls(stream) => stream.get_ref().0,
        }
    }

    /// The remote address of this transport.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Io::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Io::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Io::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Io::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug)]
struct State {
    phase: Phase,
    canceled: bool,
    io: Option<Io>,
    handshake: Option<Handshake>,
    protocol: Option<Protocol>,
    session: Option<Arc<Session>>,
    allocation_limit: usize,
    calls: HashSet<CallId>,
    success_count: u64,
    route_failure_count: u32,
    refused_stream_count: u32,
    idle_at: Instant,
}

/// One physical connection to an origin.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    route: Route,
    slot_freed: Notify,
    state: Mutex<State>,
}

impl Connection {
    pub(crate) fn new(route: Route) -> Arc<Self> {
        Arc::new(Self {
            id: ConnId::next(),
            route,
            slot_freed: Notify::new(),
            state: Mutex::new(State {
                phase: Phase::Idle,
                canceled: false,
                io: None,
                handshake: None,
                protocol: None,
                session: None,
                allocation_limit: 1,
                calls: HashSet::new(),
                success_count: 0,
                route_failure_count: 0,
                refused_stream_count: 0,
                idle_at: Instant::now(),
            }),
        })
    }

    /// This connection's identifier.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// The route this connection was built for.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// The negotiated application protocol, once established.
    pub fn protocol(&self) -> Option<Protocol> {
        self.state.lock().protocol
    }

    /// The TLS handshake record, for secure connections.
    pub fn handshake(&self) -> Option<Handshake> {
        self.state.lock().handshake.clone()
    }

    /// The multiplexed session, when the negotiated protocol has one.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.clone()
    }

    /// Whether the negotiated protocol multiplexes exchanges.
    pub fn is_multiplexed(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Whether this connection may host new exchanges.
    pub fn no_new_exchanges(&self) -> bool {
        self.state.lock().phase >= Phase::NoNewExchanges
    }

    /// Completed exchanges on this connection.
    pub fn success_count(&self) -> u64 {
        self.state.lock().success_count
    }

    pub(crate) fn route_failure_count(&self) -> u32 {
        self.state.lock().route_failure_count
    }

    #[cfg(test)]
    pub(crate) fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub(crate) fn is_brand_new(&self) -> bool {
        let state = self.state.lock();
        state.success_count == 0 && state.session.is_none()
    }

    /// Stop accepting new exchanges. Monotonic.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        Self::retire_locked(&mut state);
    }

    fn retire_locked(state: &mut State) {
        if state.phase < Phase::NoNewExchanges {
            state.phase = Phase::NoNewExchanges;
        }
    }

    /// Close the connection, returning the transport for the caller to drop
    /// once no locks are held.
    #[must_use = "drop the returned transport after releasing any locks"]
    pub(crate) fn close(&self) -> Option<Io> {
        let mut state = self.state.lock();
        state.phase = Phase::Closed;
        state.io.take()
    }

    /// Cancel the connection: close the transport out from under whatever is
    /// using it.
    pub fn cancel(&self) {
        let io = {
            let mut state = self.state.lock();
            state.canceled = true;
            state.phase = Phase::Closed;
            state.io.take()
        };
        drop(io);
    }

    fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock();
        if state.phase < Phase::NoNewExchanges {
            state.phase = phase;
        }
    }

    /// The peer advertised a new concurrent-stream limit.
    pub fn on_settings(&self, max_concurrent_streams: usize) {
        let mut state = self.state.lock();
        if let Some(session) = &state.session {
            session.apply_settings(max_concurrent_streams);
            state.allocation_limit = max_concurrent_streams;
        }
        drop(state);
        self.slot_freed.notify_waiters();
    }

    /// An exchange completed in both directions.
    pub(crate) fn increment_success(&self) {
        self.state.lock().success_count += 1;
    }

    pub(crate) fn attach(&self, call: CallId) {
        self.state.lock().calls.insert(call);
    }

    /// Detach `call`. Returns true when the connection became idle.
    pub(crate) fn detach(&self, call: CallId) -> bool {
        let idle = {
            let mut state = self.state.lock();
            state.calls.remove(&call);
            if state.calls.is_empty() {
                state.idle_at = Instant::now();
                true
            } else {
                false
            }
        };
        self.slot_freed.notify_waiters();
        idle
    }

    pub(crate) fn in_use(&self) -> bool {
        !self.state.lock().calls.is_empty()
    }

    /// How long this connection has been idle, or `None` while in use.
    pub(crate) fn idle_duration(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        if state.calls.is_empty() {
            Some(now.saturating_duration_since(state.idle_at))
        } else {
            None
        }
    }

    /// Wait until a stream slot may have freed up.
    pub(crate) async fn slot_freed(&self) {
        self.slot_freed.notified().await;
    }

    /// Atomically check eligibility for `address` and attach `call`.
    ///
    /// `routes` enables cross-host sharing: a multiplexed connection whose
    /// direct route lands on the same socket address, and whose certificate
    /// covers the new host, can carry it.
    pub(crate) fn try_acquire(
        &self,
        address: &Address,
        routes: Option<&[Route]>,
        call: CallId,
    ) -> bool {
        let mut state = self.state.lock();
        if !self.eligible_locked(&state, address, routes) {
            return false;
        }
        state.calls.insert(call);
        true
    }

    /// Same-host connection that would be eligible if it had a free slot.
    pub(crate) fn is_busy_candidate(&self, address: &Address) -> bool {
        let state = self.state.lock();
        state.session.is_some()
            && state.phase < Phase::NoNewExchanges
            && state.calls.len() >= state.allocation_limit
            && self.route.address().host() == address.host()
            && self.route.address().equals_non_host(address)
    }

    fn eligible_locked(&self, state: &State, address: &Address, routes: Option<&[Route]>) -> bool {
        if state.calls.len() >= state.allocation_limit || state.phase >= Phase::NoNewExchanges {
            return false;
        }
        let ours = self.route.address();
        if !ours.equals_non_host(address) {
            return false;
        }
        if address.host() == ours.host() {
            return true;
        }

        // Cross-host sharing (coalescing) requires a multiplexed session...
        if state.session.is_none() {
            return false;
        }
        // ...a direct route to the same socket address...
        if !self.route.proxy().is_direct() {
            return false;
        }
        let Some(routes) = routes else {
            return false;
        };
        if !routes
            .iter()
            .any(|route| route.proxy().is_direct() && route.socket_addr() == self.route.socket_addr())
        {
            return false;
        }
        // ...the standard hostname verifier, a certificate covering the new
        // host, and satisfied pins.
        let Some(materials) = address.tls() else {
            return false;
        };
        if !materials.verifier.is_default() {
            return false;
        }
        let Some(handshake) = &state.handshake else {
            return false;
        };
        if !materials
            .verifier
            .verify(address.host(), &handshake.peer_certificates)
        {
            return false;
        }
        materials
            .pinner
            .check(address.host(), &handshake.peer_certificates)
            .is_ok()
    }

    /// Record a failure attributed to this connection.
    ///
    /// A refused stream is tolerated once; a second refusal, or any failure
    /// other than local cancellation, retires the connection and counts a
    /// route failure. The route database learns of the failure only when
    /// this connection never completed an exchange.
    pub(crate) fn track_failure(&self, database: &RouteDatabase, error: &Error) {
        let mut state = self.state.lock();
        match error {
            Error::Stream(StreamError::Refused) => {
                state.refused_stream_count += 1;
                if state.refused_stream_count > 1 {
                    Self::retire_locked(&mut state);
                    state.route_failure_count += 1;
                    if state.success_count == 0 {
                        database.failed(&self.route);
                    }
                }
            }
            Error::Stream(StreamError::Canceled) => {}
            _ => {
                Self::retire_locked(&mut state);
                state.route_failure_count += 1;
                if state.success_count == 0 {
                    database.failed(&self.route);
                }
            }
        }
    }

    /// Whether the connection looks able to host an exchange right now.
    ///
    /// Multiplexed connections answer from session health. Otherwise, when
    /// `extensive` is set, a short read probe distinguishes a silently
    /// closed peer from a quiet one.
    pub async fn is_healthy(&self, extensive: bool) -> bool {
        let io = {
            let mut state = self.state.lock();
            if state.phase >= Phase::NoNewExchanges {
                return false;
            }
            if let Some(session) = &state.session {
                return session.is_healthy();
            }
            if state.io.is_none() {
                return false;
            }
            if !extensive {
                return true;
            }
            state.io.take()
        };
        let Some(io) = io else { return true };

        let mut probe = [0u8; 1];
        let healthy = match tokio::time::timeout(
            Duration::from_millis(1),
            io.tcp().peek(&mut probe),
        )
        .await
        {
            Err(_) => true,       // quiet socket
            Ok(Ok(0)) => false,   // peer closed
            Ok(Ok(_)) => true,    // bytes waiting for the next exchange
            Ok(Err(_)) => false,
        };

        let mut state = self.state.lock();
        if state.phase == Phase::Closed || state.canceled {
            drop(state);
            drop(io);
            return false;
        }
        state.io = Some(io);
        healthy
    }

    /// Take the transport, for a wire codec that needs exclusive ownership.
    pub fn detach_io(&self) -> Option<Io> {
        self.state.lock().io.take()
    }

    /// Return a transport taken with [`Connection::detach_io`].
    pub fn restore_io(&self, io: Io) {
        let mut state = self.state.lock();
        if state.phase == Phase::Closed || state.canceled {
            drop(state);
            drop(io);
            return;
        }
        state.io = Some(io);
    }

    /// Establish this connection: TCP, optional tunnel, optional TLS.
    ///
    /// On failure every partially-established resource is closed and the
    /// accumulated attempt errors are returned.
    pub(crate) async fn connect(
        &self,
        options: &Options,
        call: CallId,
        events: &dyn EventListener,
    ) -> Result<(), RouteError> {
        debug_assert_eq!(self.phase(), Phase::Idle, "connect() is single-use");
        self.set_phase(Phase::Connecting);

        let address = self.route.address();
        if !address.is_secure() {
            if !address.tls_specs().iter().any(|spec| !spec.is_secure()) {
                let error = ConnectError::CleartextNotPermitted(address.host().to_owned());
                events.connect_failed(call, &self.route, &error);
                let _ = self.close();
                return Err(RouteError::new(error));
            }
        } else if address.protocols().contains(&Protocol::H2PriorKnowledge) {
            let error = ConnectError::PriorKnowledgeWithTls(address.host().to_owned());
            events.connect_failed(call, &self.route, &error);
            let _ = self.close();
            return Err(RouteError::new(error));
        }

        let mut selector = SpecSelector::new(address.tls_specs().to_vec());
        let mut result: Option<RouteError> = None;

        loop {
            if self.is_canceled() {
                let error = ConnectError::Canceled;
                events.connect_failed(call, &self.route, &error);
                return Err(push_or_new(result, error));
            }

            match self.connect_attempt(&mut selector, options, call, events).await {
                Ok(()) => {
                    tracing::debug!(id = %self.id, route = %self.route, "connected");
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(id = %self.id, route = %self.route, %error, "connect attempt failed");
                    events.connect_failed(call, &self.route, &error);
                    self.set_phase(Phase::Connecting);
                    let retry = options.retry_on_connection_failure
                        && selector.connection_failed(&error);
                    result = Some(push_or_new(result, error));
                    if !retry {
                        let _ = self.close();
                        return Err(result.take().unwrap_or_else(|| {
                            RouteError::new(ConnectError::Canceled)
                        }));
                    }
                }
            }
        }
    }

    async fn connect_attempt(
        &self,
        selector: &mut SpecSelector,
        options: &Options,
        call: CallId,
        events: &dyn EventListener,
    ) -> Result<(), ConnectError> {
        let address = self.route.address();
        events.connect_start(call, &self.route);

        let mut tcp = connect_tcp(self.route.socket_addr(), options.connect_timeout).await?;

        if self.route.requires_tunnel() {
            self.set_phase(Phase::TunnelNegotiating);
            tcp = self.connect_tunnel(tcp, options, events).await?;
        }

        let (io, protocol, handshake) = if address.is_secure() {
            self.set_phase(Phase::HandshakingTls);
            events.secure_connect_start(call);
            match self.connect_tls(tcp, selector, options).await {
                Ok((io, handshake)) => {
                    events.secure_connect_end(call, Some(&handshake));
                    let protocol = handshake.alpn.unwrap_or(Protocol::Http11);
                    (io, protocol, Some(handshake))
                }
                Err(error) => {
                    events.secure_connect_end(call, None);
                    return Err(error);
                }
            }
        } else {
            let protocol = if address.protocols().contains(&Protocol::H2PriorKnowledge) {
                Protocol::H2PriorKnowledge
            } else {
                Protocol::Http11
            };
            (Io::Plain(tcp), protocol, None)
        };

        self.set_phase(Phase::ProtocolEstablished);

        let session = protocol
            .is_multiplexed()
            .then(|| Arc::new(Session::new(options.ping_interval)));

        {
            let mut state = self.state.lock();
            if state.canceled {
                return Err(ConnectError::Canceled);
            }
            state.allocation_limit = session
                .as_ref()
                .map(|s| s.max_concurrent_streams())
                .unwrap_or(1);
            state.io = Some(io);
            state.protocol = Some(protocol);
            state.handshake = handshake;
            state.session = session;
            state.phase = Phase::Ready;
        }

        events.connect_end(call, &self.route, Some(protocol));
        Ok(())
    }

    async fn connect_tunnel(
        &self,
        mut tcp: TcpStream,
        options: &Options,
        _events: &dyn EventListener,
    ) -> Result<TcpStream, ConnectError> {
        let address = self.route.address();
        let authenticator = address.proxy_auth().clone();
        let proxy = self.route.proxy().clone();
        let mut authorization: Option<String> = None;

        for _attempt in 0..tunnel::MAX_TUNNEL_ATTEMPTS {
            if self.is_canceled() {
                return Err(ConnectError::Canceled);
            }
            let round = tokio::time::timeout(
                options.read_timeout,
                tunnel::negotiate(
                    &mut tcp,
                    address.host(),
                    address.port(),
                    &proxy,
                    authenticator.as_ref(),
                    authorization.as_deref(),
                ),
            )
            .await
            .map_err(|_| ConnectError::Tunnel("timed out waiting for the proxy".into()))??;

            match round {
                tunnel::TunnelOutcome::Established => return Ok(tcp),
                tunnel::TunnelOutcome::Retry {
                    authorization: credentials,
                    reconnect,
                } => {
                    authorization = Some(credentials);
                    if reconnect {
                        drop(tcp);
                        tcp = connect_tcp(self.route.socket_addr(), options.connect_timeout)
                            .await?;
                    }
                }
            }
        }
        Err(ConnectError::TunnelAttemptsExhausted)
    }

    async fn connect_tls(
        &self,
        tcp: TcpStream,
        selector: &mut SpecSelector,
        options: &Options,
    ) -> Result<(Io, Handshake), ConnectError> {
        let address = self.route.address();
        let materials = address.tls().expect("secure address");

        let capabilities = SocketCapabilities::from_provider();
        let effective = selector.configure(&capabilities)?;
        let config = tls::client_config(materials, &effective, address.protocols())?;

        let server_name = ServerName::try_from(address.host().to_owned())
            .map_err(|_| TlsError::ServerName(address.host().to_owned()))?;

        let connector = tokio_rustls::TlsConnector::from(config);
        let stream = tokio::time::timeout(options.read_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| {
                TlsError::Handshake(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                ))
            })?
            .map_err(TlsError::Handshake)?;

        let (version, cipher_suite, alpn, peer_certificates) = {
            let (_, connection) = stream.get_ref();
            (
                connection.protocol_version().and_then(TlsVersion::from_rustls),
                connection
                    .negotiated_cipher_suite()
                    .map(|suite| format!("{:?}", suite.suite())),
                connection.alpn_protocol().and_then(Protocol::from_alpn),
                connection
                    .peer_certificates()
                    .map(|certs| certs.to_vec())
                    .unwrap_or_default(),
            )
        };

        if !materials.verifier.verify(address.host(), &peer_certificates) {
            return Err(ConnectError::Tls(TlsError::HostnameNotVerified {
                host: address.host().to_owned(),
            }));
        }
        materials
            .pinner
            .check(address.host(), &peer_certificates)
            .map_err(|error| ConnectError::Tls(TlsError::Pinning(error)))?;

        let handshake = Handshake {
            config: effective.name,
            version,
            cipher_suite,
            alpn,
            peer_certificates,
        };
        Ok((Io::Tls(Box::new(stream)), handshake))
    }
}

fn push_or_new(result: Option<RouteError>, error: ConnectError) -> RouteError {
    match result {
        Some(mut route_error) => {
            route_error.push(error);
            route_error
        }
        None => RouteError::new(error),
    }
}

async fn connect_tcp(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let tcp = |source| ConnectError::Tcp { addr, source };

    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(tcp)?;
    socket.set_nonblocking(true).map_err(tcp)?;
    if let Err(error) = socket.set_nodelay(true) {
        tracing::warn!(%addr, %error, "unable to set TCP_NODELAY");
    }
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(90));
    if let Err(error) = socket.set_tcp_keepalive(&keepalive) {
        tracing::warn!(%addr, %error, "unable to set TCP keepalive");
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    let stream = tokio::time::timeout(connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| tcp(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(tcp)?;
    Ok(stream)
}
