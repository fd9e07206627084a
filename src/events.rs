//! Observability hooks for the connection lifecycle.
//!
//! A single [`EventListener`] instance observes one call. Every notification
//! point fires exactly once per event, in lifecycle order: DNS before connect,
//! connect before acquisition, body start before body end.

use std::fmt;
use std::net::IpAddr;

use crate::address::Protocol;
use crate::call::CallId;
use crate::conn::Connection;
use crate::error::{ConnectError, Error};
use crate::route::Route;
use crate::secure::Handshake;

/// Observes the lifecycle of a single call.
///
/// All methods default to no-ops, so implementations override only the
/// events they care about. Implementations must not call back into the
/// connection machinery.
pub trait EventListener: Send + Sync + fmt::Debug {
    /// A call was created.
    fn call_start(&self, call: CallId) {
        let _ = call;
    }

    /// DNS resolution is starting for `host`.
    fn dns_start(&self, call: CallId, host: &str) {
        let _ = (call, host);
    }

    /// DNS resolution for `host` produced `addresses`.
    fn dns_end(&self, call: CallId, host: &str, addresses: &[IpAddr]) {
        let _ = (call, host, addresses);
    }

    /// A socket connect attempt is starting for `route`.
    fn connect_start(&self, call: CallId, route: &Route) {
        let _ = (call, route);
    }

    /// The TLS handshake is starting.
    fn secure_connect_start(&self, call: CallId) {
        let _ = call;
    }

    /// The TLS handshake finished; `handshake` is `None` when it failed.
    fn secure_connect_end(&self, call: CallId, handshake: Option<&Handshake>) {
        let _ = (call, handshake);
    }

    /// A connect attempt succeeded with the negotiated `protocol`.
    fn connect_end(&self, call: CallId, route: &Route, protocol: Option<Protocol>) {
        let _ = (call, route, protocol);
    }

    /// A connect attempt failed. Another route or TLS configuration may
    /// still be tried.
    fn connect_failed(&self, call: CallId, route: &Route, error: &ConnectError) {
        let _ = (call, route, error);
    }

    /// The call was bound to a connection, new or pooled.
    fn connection_acquired(&self, call: CallId, connection: &Connection) {
        let _ = (call, connection);
    }

    /// The call released its connection.
    fn connection_released(&self, call: CallId, connection: &Connection) {
        let _ = (call, connection);
    }

    /// The request body is about to be written.
    fn request_body_start(&self, call: CallId) {
        let _ = call;
    }

    /// The request body completed normally after `bytes` bytes.
    fn request_body_end(&self, call: CallId, bytes: u64) {
        let _ = (call, bytes);
    }

    /// Writing the request failed.
    fn request_failed(&self, call: CallId, error: &Error) {
        let _ = (call, error);
    }

    /// The response body is about to be read.
    fn response_body_start(&self, call: CallId) {
        let _ = call;
    }

    /// The response body completed normally after `bytes` bytes.
    fn response_body_end(&self, call: CallId, bytes: u64) {
        let _ = (call, bytes);
    }

    /// Reading the response failed.
    fn response_failed(&self, call: CallId, error: &Error) {
        let _ = (call, error);
    }

    /// The call finished cleanly.
    fn call_end(&self, call: CallId) {
        let _ = call;
    }

    /// The call finished with an error.
    fn call_failed(&self, call: CallId, error: &Error) {
        let _ = (call, error);
    }
}

/// A listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl EventListener for NoEvents {}
