//! Session pooling for Marlin.
//!
//! A [`Pool`] keeps idle sessions per [`Endpoint`] and hands them out to
//! logical connections. It is generic over a [`Connector`] that opens sessions
//! and a [`PooledSession`] that reports whether a session may be reused, so it
//! can be exercised without a server.
//!
//! The pool is the only structure shared between threads. Its state lives
//! behind one `Mutex`; borrowers wait on a `Condvar` when an endpoint is at
//! capacity. An optional evictor thread closes sessions that have been idle
//! too long and tops each known endpoint back up to `min_idle`.

use marlin_core::{ConfigError, Endpoint, Error, PoolError, PoolErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Sessions kept open per endpoint even when unused
    pub min_idle: usize,
    /// Maximum sessions (idle + borrowed) per endpoint
    pub max_size: usize,
    /// Idle time in milliseconds after which a session is closed
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a session in milliseconds
    pub acquire_timeout_ms: u64,
    /// How often the evictor runs, in milliseconds
    pub eviction_interval_ms: u64,
    /// Validate idle sessions before handing them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_size: 8,
            idle_timeout_ms: 600_000,      // 10 minutes
            acquire_timeout_ms: 30_000,    // 30 seconds
            eviction_interval_ms: 60_000, // 1 minute
            test_on_checkout: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given per-endpoint maximum.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Set the minimum idle sessions per endpoint.
    pub fn min_idle(mut self, n: usize) -> Self {
        self.min_idle = n;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set the evictor interval.
    pub fn eviction_interval(mut self, ms: u64) -> Self {
        self.eviction_interval_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn eviction_interval_duration(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    /// Reject configurations the pool cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(config_error("max_size must be at least 1"));
        }
        if self.min_idle > self.max_size {
            return Err(config_error(format!(
                "min_idle ({}) exceeds max_size ({})",
                self.min_idle, self.max_size
            )));
        }
        if self.eviction_interval_ms == 0 {
            return Err(config_error("eviction_interval_ms must be positive"));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
    })
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
    })
}

/// A session the pool can hold.
pub trait PooledSession: Send + 'static {
    /// The endpoint this session is connected to.
    fn endpoint(&self) -> &Endpoint;

    /// No open transaction and no pending result.
    fn is_clean(&self) -> bool;

    /// Not broken by an I/O or protocol failure.
    fn is_usable(&self) -> bool;

    /// When the session was last handed back or used.
    fn last_used(&self) -> Instant;

    /// Record that the session was just handed back; called by
    /// [`Pool::release`] before the session goes idle.
    fn touch(&mut self);

    /// Round-trip check run on checkout when `test_on_checkout` is set.
    fn validate(&mut self) -> bool {
        self.is_usable()
    }

    /// Close the session, releasing its socket.
    fn close(self);
}

/// Opens sessions to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Session: PooledSession;

    /// Establish a new session (full handshake).
    fn connect(&self, endpoint: &Endpoint) -> Result<Self::Session>;
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of sessions (active + idle)
    pub total: usize,
    /// Number of idle sessions
    pub idle: usize,
    /// Number of borrowed sessions, including ones being connected
    pub active: usize,
    /// Number of borrowers waiting for a slot
    pub waiting: usize,
    /// Sessions opened over the pool's lifetime
    pub created: u64,
    /// Sessions closed for exceeding the idle timeout
    pub evicted: u64,
}

struct PoolState<S> {
    idle: HashMap<Endpoint, VecDeque<S>>,
    active: HashMap<Endpoint, usize>,
    known: Vec<Endpoint>,
    waiting: usize,
    created: u64,
    evicted: u64,
    closed: bool,
}

impl<S: PooledSession> PoolState<S> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            active: HashMap::new(),
            known: Vec::new(),
            waiting: 0,
            created: 0,
            evicted: 0,
            closed: false,
        }
    }

    fn track(&mut self, endpoint: &Endpoint) {
        if !self.known.contains(endpoint) {
            self.known.push(endpoint.clone());
        }
    }

    fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.idle.get(endpoint).map_or(0, VecDeque::len)
    }

    fn active_count(&self, endpoint: &Endpoint) -> usize {
        self.active.get(endpoint).copied().unwrap_or(0)
    }

    fn total(&self, endpoint: &Endpoint) -> usize {
        self.idle_count(endpoint) + self.active_count(endpoint)
    }

    fn acquire_slot(&mut self, endpoint: &Endpoint) {
        *self.active.entry(endpoint.clone()).or_insert(0) += 1;
    }

    fn release_slot(&mut self, endpoint: &Endpoint) {
        if let Some(count) = self.active.get_mut(endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    /// Remove idle sessions past `timeout`, or no longer usable.
    fn take_stale(&mut self, endpoint: Option<&Endpoint>, timeout: Duration) -> Vec<S> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for (ep, queue) in &mut self.idle {
            if endpoint.is_some_and(|wanted| wanted != ep) {
                continue;
            }
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(session) = queue.pop_front() {
                let expired = now.saturating_duration_since(session.last_used()) >= timeout;
                if expired || !session.is_usable() {
                    stale.push(session);
                } else {
                    kept.push_back(session);
                }
            }
            *queue = kept;
        }
        self.evicted += stale.len() as u64;
        stale
    }

    fn drain_idle(&mut self) -> Vec<S> {
        self.idle.drain().flat_map(|(_, queue)| queue).collect()
    }
}

enum Checkout<S> {
    Idle(S),
    Create,
}

fn close_all<S: PooledSession>(sessions: Vec<S>) {
    for session in sessions {
        session.close();
    }
}

/// Bounded per-endpoint session pool.
pub struct Pool<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Session>>,
    available: Condvar,
    evictor_wake: Condvar,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Pool<C> {
    /// Create a pool. The configuration is validated up front.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            max_size = config.max_size,
            min_idle = config.min_idle,
            idle_timeout_ms = config.idle_timeout_ms,
            "Creating session pool"
        );
        Ok(Self {
            connector,
            config,
            state: Mutex::new(PoolState::new()),
            available: Condvar::new(),
            evictor_wake: Condvar::new(),
            evictor: Mutex::new(None),
        })
    }

    /// Create a pool and start its evictor thread.
    pub fn with_evictor(connector: C, config: PoolConfig) -> Result<Arc<Self>> {
        let pool = Arc::new(Self::new(connector, config)?);
        pool.start_evictor()?;
        Ok(pool)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C::Session>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Borrow a session for `endpoint`.
    ///
    /// Stale idle sessions are evicted first. When none is idle a new
    /// session is opened if the endpoint is below `max_size`; otherwise the
    /// caller waits up to the acquire timeout.
    pub fn borrow(&self, endpoint: &Endpoint) -> Result<C::Session> {
        let deadline = Instant::now() + self.config.acquire_timeout_duration();
        loop {
            let mut stale = Vec::new();
            let outcome = self.checkout(endpoint, deadline, &mut stale);
            close_all(stale);
            match outcome? {
                Checkout::Idle(mut session) => {
                    if !self.config.test_on_checkout || session.validate() {
                        tracing::trace!(endpoint = %endpoint, "Reusing idle session");
                        return Ok(session);
                    }
                    tracing::debug!(endpoint = %endpoint, "Idle session failed validation");
                    self.discard(session);
                }
                Checkout::Create => return self.create(endpoint),
            }
        }
    }

    fn checkout(
        &self,
        endpoint: &Endpoint,
        deadline: Instant,
        stale: &mut Vec<C::Session>,
    ) -> Result<Checkout<C::Session>> {
        let mut state = self.lock();
        state.track(endpoint);
        loop {
            if state.closed {
                return Err(pool_error(PoolErrorKind::Closed, "pool has been shut down"));
            }
            stale.extend(state.take_stale(Some(endpoint), self.config.idle_timeout_duration()));

            let idle = state.idle.get_mut(endpoint).and_then(VecDeque::pop_back);
            if let Some(session) = idle {
                state.acquire_slot(endpoint);
                return Ok(Checkout::Idle(session));
            }
            if state.total(endpoint) < self.config.max_size {
                state.acquire_slot(endpoint);
                return Ok(Checkout::Create);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(endpoint = %endpoint, "Pool exhausted");
                return Err(pool_error(
                    PoolErrorKind::Exhausted,
                    format!(
                        "no session for {} within {} ms (max_size {})",
                        endpoint.address(),
                        self.config.acquire_timeout_ms,
                        self.config.max_size
                    ),
                ));
            }
            state.waiting += 1;
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
            state.waiting -= 1;
        }
    }

    fn create(&self, endpoint: &Endpoint) -> Result<C::Session> {
        match self.connector.connect(endpoint) {
            Ok(session) => {
                self.lock().created += 1;
                tracing::debug!(endpoint = %endpoint, "Opened new session");
                Ok(session)
            }
            Err(e) => {
                self.lock().release_slot(endpoint);
                self.available.notify_all();
                Err(e)
            }
        }
    }

    /// Return a borrowed session. Clean sessions become idle; any other
    /// session is closed.
    ///
    /// Waiters for every endpoint share one condvar, so all of them are
    /// woken and each rechecks its own endpoint.
    pub fn release(&self, mut session: C::Session) {
        let endpoint = session.endpoint().clone();
        let mut state = self.lock();
        state.release_slot(&endpoint);
        if !state.closed && session.is_clean() && session.is_usable() {
            session.touch();
            state.idle.entry(endpoint).or_default().push_back(session);
            drop(state);
            self.available.notify_all();
            return;
        }
        drop(state);
        self.available.notify_all();
        tracing::debug!(endpoint = %endpoint, "Closing session on release");
        session.close();
    }

    /// Close a borrowed session and stop tracking it.
    pub fn discard(&self, session: C::Session) {
        let endpoint = session.endpoint().clone();
        self.lock().release_slot(&endpoint);
        self.available.notify_all();
        tracing::debug!(endpoint = %endpoint, "Discarding session");
        session.close();
    }

    /// Close idle sessions that exceeded the idle timeout. Returns how many
    /// were closed.
    pub fn evict_idle(&self) -> usize {
        let stale = self
            .lock()
            .take_stale(None, self.config.idle_timeout_duration());
        let count = stale.len();
        if count > 0 {
            tracing::info!(count, "Evicted idle sessions");
        }
        close_all(stale);
        count
    }

    /// Open sessions until every known endpoint has `min_idle` idle ones,
    /// staying within `max_size`.
    pub fn ensure_min_idle(&self) {
        if self.config.min_idle == 0 {
            return;
        }
        let endpoints = self.lock().known.clone();
        for endpoint in endpoints {
            loop {
                {
                    let mut state = self.lock();
                    if state.closed {
                        return;
                    }
                    if state.idle_count(&endpoint) >= self.config.min_idle
                        || state.total(&endpoint) >= self.config.max_size
                    {
                        break;
                    }
                    state.acquire_slot(&endpoint);
                }
                match self.create(&endpoint) {
                    Ok(session) => self.release(session),
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "Could not top up idle sessions");
                        break;
                    }
                }
            }
        }
    }

    /// Register an endpoint for `min_idle` maintenance without borrowing.
    pub fn track(&self, endpoint: &Endpoint) {
        self.lock().track(endpoint);
    }

    /// Start the background evictor. Calling it twice is a no-op.
    pub fn start_evictor(self: &Arc<Self>) -> Result<()> {
        let mut slot = self
            .evictor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.eviction_interval_duration();
        let handle = thread::Builder::new()
            .name("marlin-pool-evictor".to_string())
            .spawn(move || run_evictor(&weak, interval))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Close every idle session and refuse further borrows.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.drain_idle()
        };
        tracing::info!(idle = idle.len(), "Shutting down session pool");
        self.available.notify_all();
        self.evictor_wake.notify_all();
        close_all(idle);

        let handle = self
            .evictor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("Pool evictor thread panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let idle: usize = state.idle.values().map(VecDeque::len).sum();
        let active: usize = state.active.values().sum();
        PoolStats {
            total: idle + active,
            idle,
            active,
            waiting: state.waiting,
            created: state.created,
            evicted: state.evicted,
        }
    }

    /// Idle sessions currently held for `endpoint`.
    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.lock().idle_count(endpoint)
    }
}

fn run_evictor<C: Connector>(weak: &Weak<Pool<C>>, interval: Duration) {
    loop {
        let Some(pool) = weak.upgrade() else {
            return;
        };
        {
            let state = pool.lock();
            if state.closed {
                return;
            }
            let (state, _) = pool
                .evictor_wake
                .wait_timeout(state, interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.closed {
                return;
            }
        }
        pool.evict_idle();
        pool.ensure_min_idle();
    }
}

impl<C: Connector> Drop for Pool<C> {
    fn drop(&mut self) {
        let idle = self.lock().drain_idle();
        close_all(idle);
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Shares one pool per configuration fingerprint.
///
/// Fingerprints are produced with [`marlin_core::map_hash`] over the
/// option map, so equal option sets reach the same pool regardless of the
/// order the options were given in.
pub struct PoolRegistry<C: Connector> {
    pools: Mutex<HashMap<u64, Arc<Pool<C>>>>,
}

impl<C: Connector> Default for PoolRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> PoolRegistry<C> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pool for `fingerprint`, creating it with `make` if absent or
    /// if the previous one was shut down.
    pub fn get_or_create<F>(&self, fingerprint: u64, make: F) -> Result<Arc<Pool<C>>>
    where
        F: FnOnce() -> Result<Arc<Pool<C>>>,
    {
        let mut pools = self
            .pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(pool) = pools.get(&fingerprint) {
            if !pool.is_closed() {
                return Ok(Arc::clone(pool));
            }
        }
        let pool = make()?;
        tracing::debug!(fingerprint, "Registered pool");
        pools.insert(fingerprint, Arc::clone(&pool));
        Ok(pool)
    }

    /// Remove and shut down the pool for `fingerprint`.
    pub fn remove(&self, fingerprint: u64) -> bool {
        let pool = self
            .pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&fingerprint);
        match pool {
            Some(pool) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every registered pool.
    pub fn shutdown_all(&self) {
        let pools: Vec<_> = self
            .pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.shutdown();
        }
    }
}
