//! Error taxonomy for connection establishment and exchange coordination.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::secure::PinError;

/// A boxed error, for type-erased error chains.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error from a single connection attempt.
///
/// Attempts are retried across TLS fallback configurations and across routes;
/// the accumulated history is reported as a [`RouteError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The target requires cleartext but no cleartext configuration is enabled.
    #[error("cleartext communication not enabled for {0}")]
    CleartextNotPermitted(String),

    /// Prior-knowledge HTTP/2 was requested together with TLS.
    #[error("prior-knowledge multiplexing cannot be used with TLS for {0}")]
    PriorKnowledgeWithTls(String),

    /// DNS resolution failed or returned no addresses.
    #[error("failed to resolve {host}")]
    Dns {
        /// The hostname that could not be resolved.
        host: String,
        /// The resolver error.
        #[source]
        source: io::Error,
    },

    /// Every route and every postponed route has been attempted.
    #[error("exhausted all routes")]
    RoutesExhausted,

    /// The TCP connection could not be established.
    #[error("failed to connect to {addr}")]
    Tcp {
        /// The socket address that refused us.
        addr: SocketAddr,
        /// The socket error.
        #[source]
        source: io::Error,
    },

    /// The proxy refused or mangled the CONNECT tunnel.
    #[error("proxy tunnel failed: {0}")]
    Tunnel(String),

    /// The proxy kept issuing authentication challenges.
    #[error("too many tunnel attempts")]
    TunnelAttemptsExhausted,

    /// TLS negotiation or peer verification failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The call was canceled while connecting.
    #[error("canceled")]
    Canceled,
}

/// An error during TLS negotiation or peer verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// No enabled TLS configuration is compatible with what the local
    /// provider offers.
    #[error("no TLS configuration compatible with the enabled protocols: {0}")]
    UnsupportedProtocols(String),

    /// The hostname is not a valid TLS server name.
    #[error("invalid server name {0}")]
    ServerName(String),

    /// The handshake itself failed.
    #[error("TLS handshake failed")]
    Handshake(#[source] io::Error),

    /// The peer's certificate chain does not cover the requested hostname.
    #[error("hostname {host} not verified by the peer certificate")]
    HostnameNotVerified {
        /// The hostname which failed verification.
        host: String,
    },

    /// The peer's certificate chain does not satisfy the configured pins.
    #[error(transparent)]
    Pinning(#[from] PinError),
}

/// Every candidate route for a call failed.
///
/// Carries the first failure and any suppressed later failures, in order.
#[derive(Debug, Error)]
#[error("connect failed after {} route attempt(s)", 1 + self.suppressed.len())]
pub struct RouteError {
    #[source]
    first: ConnectError,
    suppressed: Vec<ConnectError>,
}

impl RouteError {
    pub(crate) fn new(first: ConnectError) -> Self {
        Self {
            first,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, error: ConnectError) {
        self.suppressed.push(error);
    }

    /// The first failure observed.
    pub fn first(&self) -> &ConnectError {
        &self.first
    }

    /// The most recent failure observed.
    pub fn last(&self) -> &ConnectError {
        self.suppressed.last().unwrap_or(&self.first)
    }

    /// Failures after the first, oldest first.
    pub fn suppressed(&self) -> &[ConnectError] {
        &self.suppressed
    }
}

/// A stream-level failure reported by the wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The peer refused the stream. Tolerated once per connection.
    #[error("stream refused by the peer")]
    Refused,

    /// The exchange was canceled locally. The connection is unaffected.
    #[error("stream canceled")]
    Canceled,

    /// The stream or its session was torn down.
    #[error("stream reset")]
    Reset,
}

/// A body violated its declared framing. Always fatal to the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// More bytes moved than the declared content length.
    #[error("body exceeds declared content length of {expected}")]
    Overrun {
        /// The declared content length.
        expected: u64,
    },

    /// The body ended before the declared content length was reached.
    #[error("unexpected end of stream ({actual} of {expected} bytes)")]
    Truncated {
        /// The declared content length.
        expected: u64,
        /// The bytes actually moved.
        actual: u64,
    },
}

/// Top-level error for exchange coordination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Connection establishment failed on every route.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// A stream-level failure from the wire codec.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A body framing violation.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// An I/O error moving body bytes.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The call's overall deadline elapsed.
    #[error("call timed out")]
    Timeout {
        /// The error in flight when the deadline fired, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// The call was canceled.
    #[error("call canceled")]
    Canceled,

    /// The caller violated the exchange protocol.
    #[error("{0}")]
    State(&'static str),
}

impl Error {
    /// Whether this error is the distinguished call-timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
