//! Stream accounting for multiplexed protocol sessions.

use std::time::Duration;

use parking_lot::Mutex;

/// Concurrent streams assumed until the peer's settings arrive.
pub(crate) const DEFAULT_CONCURRENT_STREAMS: usize = 128;

/// Bookkeeping for one multiplexed protocol session.
///
/// The wire codec owns the actual framing; this records what the connection
/// machinery needs: the peer's concurrent-stream limit and whether the
/// session can still host new streams.
#[derive(Debug)]
pub struct Session {
    state: Mutex<State>,
    ping_interval: Option<Duration>,
}

#[derive(Debug)]
struct State {
    max_concurrent_streams: usize,
    healthy: bool,
}

impl Session {
    pub(crate) fn new(ping_interval: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(State {
                max_concurrent_streams: DEFAULT_CONCURRENT_STREAMS,
                healthy: true,
            }),
            ping_interval,
        }
    }

    /// The peer's concurrent-stream limit.
    pub fn max_concurrent_streams(&self) -> usize {
        self.state.lock().max_concurrent_streams
    }

    /// The keep-alive ping interval, when configured.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    /// Whether the session can still host new streams.
    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    /// The session received a shutdown signal; no new streams.
    pub fn shutdown(&self) {
        self.state.lock().healthy = false;
    }

    pub(crate) fn apply_settings(&self, max_concurrent_streams: usize) {
        self.state.lock().max_concurrent_streams = max_concurrent_streams;
    }
}
