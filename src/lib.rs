//! Towline
//!
//! Connection management for HTTP clients: routes, TLS fallback, a
//! connection pool, and per-call exchange coordination. Towline does not
//! speak HTTP itself; a wire codec plugs in at the [`codec`] boundary and
//! drives bodies through the framing wrappers in [`body`].
//!
//! The pieces, bottom up:
//!
//! - An [`Address`](address::Address) describes an origin and everything
//!   needed to reach it: resolver, proxy policy, TLS materials, protocols.
//! - A [`Route`](route::Route) is one concrete path there; the
//!   [`RouteSelector`](route::RouteSelector) iterates candidates with
//!   recently failed routes postponed to last.
//! - A [`Connection`](conn::Connection) owns one transport and walks the
//!   TLS configuration ladder when handshakes fail.
//! - The [`Pool`](pool::Pool) keeps connections between exchanges and
//!   shares multiplexed sessions across calls, including across hosts.
//! - A [`Transmitter`](call::Transmitter) coordinates one call end to end.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod address;
pub mod body;
pub mod call;
pub mod codec;
pub mod conn;
pub mod dns;
pub mod error;
pub mod events;
pub mod pool;
pub mod route;
pub mod secure;
pub mod tls;

pub use self::address::{Address, Protocol, Proxy};
pub use self::call::{CallId, Exchange, Options, Transmitter};
pub use self::codec::{Codec, CodecFactory};
pub use self::conn::Connection;
pub use self::error::Error;
pub use self::events::EventListener;
pub use self::pool::{Pool, PoolConfig};
pub use self::route::Route;
pub use self::tls::TlsSpec;
