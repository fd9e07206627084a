//! The connection pool.
//!
//! Connections live here between exchanges. Acquisition prefers an eligible
//! pooled connection over dialing; idle connections are evicted by a
//! background sweep once they outlive the keep-alive window or the idle
//! count exceeds its bound. All membership changes happen under the pool
//! lock, and sockets are closed only after the lock is released.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::address::Address;
use crate::call::CallId;
use crate::conn::{Connection, Io};
use crate::route::{Route, RouteDatabase};

/// Pool sizing and eviction policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Most idle connections kept, across all origins.
    pub max_idle: usize,
    /// How long an idle connection is kept.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 5,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

/// Result of a pool acquisition attempt.
#[derive(Debug)]
pub(crate) enum Acquired {
    /// An eligible connection, already attached to the call.
    Hit(Arc<Connection>),
    /// Every eligible connection is a multiplexed session at capacity;
    /// waiting on this one may yield a slot.
    Busy(Arc<Connection>),
    /// Nothing usable; dial a new connection.
    Miss,
}

#[derive(Debug, Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    sweeper: bool,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    database: Arc<RouteDatabase>,
    state: Mutex<PoolState>,
    sweep: Arc<Notify>,
}

pub(crate) enum Sweep {
    /// A connection was evicted; sweep again immediately.
    Evicted,
    /// Sleep this long before the next sweep.
    Wait(Duration),
    /// The pool is empty; the sweeper exits.
    Stop,
}

/// A shared pool of physical connections.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// A pool with the given policy.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                database: Arc::new(RouteDatabase::new()),
                state: Mutex::new(PoolState::default()),
                sweep: Arc::new(Notify::new()),
            }),
        }
    }

    /// The route database shared by calls using this pool.
    pub fn database(&self) -> &Arc<RouteDatabase> {
        &self.inner.database
    }

    /// Connections currently in the pool, idle or in use.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Connections currently idle.
    pub fn idle_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| !c.in_use())
            .count()
    }

    /// Find an eligible connection for `address` and attach `call` to it.
    pub(crate) fn acquire(
        &self,
        address: &Address,
        call: CallId,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
    ) -> Acquired {
        let state = self.inner.state.lock();
        let mut busy = None;
        for connection in &state.connections {
            if require_multiplexed && !connection.is_multiplexed() {
                continue;
            }
            if connection.try_acquire(address, routes, call) {
                tracing::trace!(id = %connection.id(), %call, "pooled connection acquired");
                return Acquired::Hit(connection.clone());
            }
            if busy.is_none() && connection.is_busy_candidate(address) {
                busy = Some(connection.clone());
            }
        }
        match busy {
            Some(connection) => Acquired::Busy(connection),
            None => Acquired::Miss,
        }
    }

    /// Add a freshly connected `connection`, attached to `call`.
    pub(crate) fn put(&self, connection: Arc<Connection>, call: CallId) {
        let mut state = self.inner.state.lock();
        connection.attach(call);
        tracing::trace!(id = %connection.id(), %call, "connection pooled");
        state.connections.push(connection);
        self.spawn_sweeper(&mut state);
    }

    /// Detach `call` from `connection`.
    ///
    /// When the connection becomes idle and cannot be reused, it is removed
    /// and its transport returned; the caller drops it once no locks are
    /// held.
    #[must_use = "drop the returned transport after releasing any locks"]
    pub(crate) fn release(&self, connection: &Arc<Connection>, call: CallId) -> Option<Io> {
        let mut state = self.inner.state.lock();
        let idle = connection.detach(call);
        if !idle {
            return None;
        }
        if connection.no_new_exchanges() || self.inner.config.max_idle == 0 {
            state
                .connections
                .retain(|c| !Arc::ptr_eq(c, connection));
            tracing::trace!(id = %connection.id(), "idle connection discarded");
            return connection.close();
        }
        self.inner.sweep.notify_one();
        None
    }

    /// Close every idle connection now.
    pub fn evict_all(&self) {
        let mut closed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.connections.retain(|connection| {
                if connection.in_use() {
                    true
                } else {
                    connection.retire();
                    if let Some(io) = connection.close() {
                        closed.push(io);
                    }
                    false
                }
            });
        }
        drop(closed);
    }

    /// One eviction pass.
    ///
    /// Evicts the longest-idle connection when it has outlived the
    /// keep-alive window or the idle count exceeds the bound; otherwise
    /// reports how long to sleep. Connections with attached calls are never
    /// touched.
    pub(crate) fn sweep(&self, now: Instant) -> Sweep {
        let mut close = None;
        let outcome = {
            let mut state = self.inner.state.lock();
            let mut in_use = 0usize;
            let mut idle = 0usize;
            let mut longest: Option<(usize, Duration)> = None;

            for (index, connection) in state.connections.iter().enumerate() {
                match connection.idle_duration(now) {
                    None => in_use += 1,
                    Some(duration) => {
                        idle += 1;
                        if longest.map_or(true, |(_, d)| duration > d) {
                            longest = Some((index, duration));
                        }
                    }
                }
            }

            match longest {
                Some((index, duration))
                    if duration >= self.inner.config.keep_alive
                        || idle > self.inner.config.max_idle =>
                {
                    let connection = state.connections.remove(index);
                    connection.retire();
                    close = connection.close();
                    tracing::debug!(id = %connection.id(), ?duration, "evicting idle connection");
                    Sweep::Evicted
                }
                Some((_, duration)) => Sweep::Wait(self.inner.config.keep_alive - duration),
                None if in_use > 0 => Sweep::Wait(self.inner.config.keep_alive),
                None => {
                    state.sweeper = false;
                    Sweep::Stop
                }
            }
        };
        drop(close);
        outcome
    }

    fn spawn_sweeper(&self, state: &mut PoolState) {
        if state.sweeper {
            return;
        }
        state.sweeper = true;
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(sweeper(inner));
    }
}

async fn sweeper(inner: Weak<PoolInner>) {
    loop {
        let Some(strong) = inner.upgrade() else { return };
        let pool = Pool { inner: strong };
        match pool.sweep(Instant::now()) {
            Sweep::Evicted => continue,
            Sweep::Stop => return,
            Sweep::Wait(duration) => {
                let sweep = pool.inner.sweep.clone();
                drop(pool);
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = sweep.notified() => {}
                }
            }
        }
    }
}
