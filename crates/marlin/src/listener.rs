//! Failover and routing for one logical connection.
//!
//! The listener owns the physical sessions a logical connection currently
//! uses, keyed by endpoint. Every operation goes through [`Listener::run`],
//! which picks a session for the requested [`Route`] according to the HA
//! mode, runs the operation, and on a transient failure discards the
//! session, re-prepares its statements on a replacement and retries once.

use crate::aurora;
use crate::ha::HaMode;
use crate::routing::Router;
use crate::statement::StatementRegistry;
use marlin_core::{ConnectionError, ConnectionErrorKind, Endpoint, Error, Result};
use marlin_mariadb::{MariaDbConnector, ServerStatement, Session};
use marlin_pool::Pool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The pool type sessions are borrowed from.
pub type SessionPool = Pool<MariaDbConnector>;

/// Statement bindings keyed by session token.
pub type Statements = StatementRegistry<ServerStatement>;

/// Where an operation may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The writer (or the only endpoint in use).
    Write,
    /// A reader when the mode splits reads, the writer otherwise.
    Read,
}

fn any_endpoint(_: &Endpoint) -> bool {
    true
}

fn writer_endpoint(endpoint: &Endpoint) -> bool {
    endpoint.is_writer()
}

fn reader_endpoint(endpoint: &Endpoint) -> bool {
    !endpoint.is_writer()
}

fn read_only_sql(read_only: bool) -> &'static str {
    if read_only {
        "SET SESSION TRANSACTION READ ONLY"
    } else {
        "SET SESSION TRANSACTION READ WRITE"
    }
}

fn unavailable(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: message.into(),
        source: None,
    })
}

fn disconnected(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: message.into(),
        source: None,
    })
}

/// Session routing and failover state of one logical connection.
pub struct Listener {
    mode: HaMode,
    pool: Arc<SessionPool>,
    router: Router,
    configured: Vec<Endpoint>,
    sessions: HashMap<Endpoint, Session>,
    /// Sticky session of single-writer routing.
    primary: Option<Endpoint>,
    /// Session that ran the last operation.
    current: Option<Endpoint>,
    scan_from: usize,
    topology_stale: bool,
    read_only: bool,
    fatal: bool,
    closed: bool,
    statements: Statements,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("mode", &self.mode)
            .field("endpoints", &self.router.endpoints())
            .field("sessions", &self.sessions.len())
            .field("primary", &self.primary)
            .field("current", &self.current)
            .field("statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Connect according to `mode`.
    ///
    /// Single-writer modes connect their writer; LOADBALANCE connects the
    /// first reachable endpoint; AURORA reads the cluster topology first.
    #[tracing::instrument(level = "debug", skip_all, fields(mode = %mode, endpoints = endpoints.len()))]
    pub fn open(
        mode: HaMode,
        endpoints: Vec<Endpoint>,
        pool: Arc<SessionPool>,
        failure_threshold: u32,
        backoff: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one endpoint is required".to_string(),
            ));
        }
        let mut listener = Self {
            mode,
            pool,
            router: Router::new(endpoints.clone(), failure_threshold, backoff),
            configured: endpoints,
            sessions: HashMap::new(),
            primary: None,
            current: None,
            scan_from: 0,
            topology_stale: mode == HaMode::Aurora,
            read_only: false,
            fatal: false,
            closed: false,
            statements: StatementRegistry::new(),
        };
        let connected = match mode {
            HaMode::None | HaMode::Sequential => listener.writer(any_endpoint),
            HaMode::LoadBalance => listener.scan(any_endpoint),
            HaMode::Replication => listener.writer(writer_endpoint),
            HaMode::Aurora => listener
                .refresh_topology()
                .and_then(|()| listener.writer(writer_endpoint)),
        };
        let endpoint = connected?;
        info!(endpoint = %endpoint, mode = %mode, "logical connection opened");
        Ok(listener)
    }

    pub fn mode(&self) -> HaMode {
        self.mode
    }

    /// Endpoints currently routed to. For AURORA this is the resolved
    /// instance list.
    pub fn endpoints(&self) -> &[Endpoint] {
        self.router.endpoints()
    }

    /// Endpoints with a session held by this connection.
    pub fn active_endpoints(&self) -> Vec<&Endpoint> {
        self.sessions.keys().collect()
    }

    /// Endpoint of the session that ran the last operation.
    pub fn current_endpoint(&self) -> Option<&Endpoint> {
        self.current.as_ref()
    }

    /// The session that ran the last operation.
    pub fn current_session(&mut self) -> Result<&mut Session> {
        self.current
            .as_ref()
            .and_then(|endpoint| self.sessions.get_mut(endpoint))
            .ok_or_else(|| disconnected("no session is in use"))
    }

    pub fn statements(&self) -> &Statements {
        &self.statements
    }

    pub fn statements_mut(&mut self) -> &mut Statements {
        &mut self.statements
    }

    pub fn in_transaction(&self) -> bool {
        self.current
            .as_ref()
            .and_then(|endpoint| self.sessions.get(endpoint))
            .is_some_and(Session::in_transaction)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run `op` on a session chosen for `route`.
    ///
    /// A transient failure outside a transaction fails over and retries
    /// `op` once on the replacement. Statement errors, authentication
    /// errors and failures inside a transaction are returned as they are.
    pub fn run<T>(
        &mut self,
        route: Route,
        mut op: impl FnMut(&mut Session, &mut Statements) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let mut orphaned: Vec<(u64, ServerStatement)> = Vec::new();
        let mut retried = false;
        loop {
            let endpoint = match self.select(route) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    if self.mode == HaMode::None && e.is_transient() {
                        self.fatal = true;
                    }
                    return Err(e);
                }
            };
            let Some(session) = self.sessions.get_mut(&endpoint) else {
                return Err(disconnected(format!("no session for {endpoint}")));
            };
            let in_transaction = session.in_transaction();
            let pending = std::mem::take(&mut orphaned);
            let result = match rebind(session, &mut self.statements, &pending) {
                Ok(()) => op(session, &mut self.statements),
                Err(e) => Err(e),
            };
            self.current = Some(endpoint.clone());

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !error.is_fatal_to_session() {
                return Err(error);
            }
            if self.mode.allows_failover() && error.is_transient() && !retried && !in_transaction {
                orphaned = self.fail(&endpoint, &error);
                retried = true;
                continue;
            }
            self.fail(&endpoint, &error);
            if self.mode == HaMode::None {
                self.fatal = true;
            }
            if retried {
                warn!(error = %error, "operation failed again after failover");
            } else if in_transaction {
                warn!(error = %error, "session lost inside a transaction, not retrying");
            }
            return Err(error);
        }
    }

    /// Change the read-only flag.
    ///
    /// Modes that split reads only change routing; the others switch the
    /// server-side transaction mode on every held session and on sessions
    /// acquired later.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        if self.read_only == read_only {
            return Ok(());
        }
        self.read_only = read_only;
        if self.mode.splits_reads() {
            return Ok(());
        }
        let endpoints: Vec<Endpoint> = self.sessions.keys().cloned().collect();
        for endpoint in endpoints {
            let Some(session) = self.sessions.get_mut(&endpoint) else {
                continue;
            };
            if let Err(e) = session.query_buffered(read_only_sql(read_only)) {
                if !e.is_fatal_to_session() {
                    return Err(e);
                }
                // Replaced lazily; the new session picks the flag up.
                self.fail(&endpoint, &e);
            }
        }
        Ok(())
    }

    /// Forget statement `id` and deallocate it on every session that has
    /// it prepared. Closing an unknown id is a no-op.
    pub fn close_statement(&mut self, id: u64) {
        let Some(bindings) = self.statements.remove(id) else {
            return;
        };
        for (token, server) in bindings {
            let Some(session) = self.sessions.values_mut().find(|s| s.token() == token) else {
                continue;
            };
            if let Err(e) = session.close_statement(&server) {
                debug!(statement = id, error = %e, "could not deallocate statement");
            }
        }
    }

    /// Return every session to the pool. Sessions with an open transaction
    /// or a broken socket are closed by the pool instead.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let endpoints: Vec<Endpoint> = self.sessions.keys().cloned().collect();
        for endpoint in &endpoints {
            self.release(endpoint);
        }
        self.statements.clear();
        self.primary = None;
        self.current = None;
        self.closed = true;
        debug!(sessions = endpoints.len(), "logical connection closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(disconnected("connection is closed"));
        }
        if self.fatal {
            return Err(disconnected("connection was lost"));
        }
        Ok(())
    }

    /// Pick the session for `route`, connecting one if needed.
    fn select(&mut self, route: Route) -> Result<Endpoint> {
        if let Some(endpoint) = &self.current {
            if self
                .sessions
                .get(endpoint)
                .is_some_and(|s| s.in_transaction() && !s.is_broken())
            {
                return Ok(endpoint.clone());
            }
        }
        match self.mode {
            HaMode::None | HaMode::Sequential => self.writer(any_endpoint),
            HaMode::LoadBalance => self.balanced(any_endpoint),
            HaMode::Replication | HaMode::Aurora => {
                if self.topology_stale {
                    if let Err(e) = self.refresh_topology() {
                        warn!(error = %e, "cluster topology refresh failed");
                    }
                }
                match route {
                    Route::Write => self.writer(writer_endpoint),
                    Route::Read => self.reader(),
                }
            }
        }
    }

    /// The sticky single-writer session, found by scanning when absent.
    fn writer(&mut self, filter: fn(&Endpoint) -> bool) -> Result<Endpoint> {
        if let Some(endpoint) = self.primary.clone() {
            match self.sessions.get(&endpoint) {
                Some(session) if !session.is_broken() => return Ok(endpoint),
                Some(_) if self.mode == HaMode::None => {
                    self.drop_broken(&endpoint);
                    self.fatal = true;
                    return Err(disconnected(format!("connection to {endpoint} was lost")));
                }
                Some(_) => self.drop_broken(&endpoint),
                None => {}
            }
            self.primary = None;
        }
        let endpoint = if self.mode == HaMode::None {
            self.acquire(0)?
        } else {
            self.scan(filter)?
        };
        self.primary = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// A reader session, falling back to the writer when no reader can be
    /// reached.
    fn reader(&mut self) -> Result<Endpoint> {
        if !self.router.endpoints().iter().any(reader_endpoint) {
            return self.writer(writer_endpoint);
        }
        match self.balanced(reader_endpoint) {
            Ok(endpoint) => Ok(endpoint),
            Err(e) if e.is_transient() => {
                debug!(error = %e, "no reader reachable, reading from the writer");
                self.writer(writer_endpoint)
            }
            Err(e) => Err(e),
        }
    }

    /// Weighted round-robin pick among available endpoints matching
    /// `filter`. When none is available, backed-off ones are scanned.
    fn balanced(&mut self, filter: fn(&Endpoint) -> bool) -> Result<Endpoint> {
        for _ in 0..self.router.len() {
            let Some(index) = self.router.next_weighted(filter) else {
                break;
            };
            match self.acquire(index) {
                Ok(endpoint) => {
                    debug!(endpoint = %endpoint, "routed by weight");
                    return Ok(endpoint);
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "endpoint unreachable");
                    self.router.record_failure(index);
                }
                Err(e) => return Err(e),
            }
        }
        self.scan(filter)
    }

    /// Try endpoints matching `filter` in order from the scan position.
    fn scan(&mut self, filter: fn(&Endpoint) -> bool) -> Result<Endpoint> {
        let candidates = self.router.candidates(self.scan_from, filter);
        let mut last_error = None;
        for index in candidates {
            match self.acquire(index) {
                Ok(endpoint) => {
                    self.scan_from = index;
                    return Ok(endpoint);
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "endpoint unreachable, trying the next one");
                    self.router.record_failure(index);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| unavailable("no endpoint available")))
    }

    /// Make sure a usable session for endpoint `index` is held.
    fn acquire(&mut self, index: usize) -> Result<Endpoint> {
        let Some(endpoint) = self.router.endpoint(index).cloned() else {
            return Err(unavailable("no endpoint available"));
        };
        match self.sessions.get(&endpoint) {
            Some(session) if !session.is_broken() => return Ok(endpoint),
            Some(_) => self.drop_broken(&endpoint),
            None => {}
        }
        let mut session = self.pool.borrow(&endpoint)?;
        if self.read_only && !self.mode.splits_reads() {
            if let Err(e) = session.query_buffered(read_only_sql(true)) {
                self.pool.discard(session);
                return Err(e);
            }
        }
        if let Some(index) = self.router.index_of(&endpoint) {
            self.router.record_success(index);
        }
        debug!(endpoint = %endpoint, token = session.token(), "session acquired");
        self.sessions.insert(endpoint.clone(), session);
        Ok(endpoint)
    }

    /// Discard a session that broke outside [`Listener::run`], e.g. while
    /// a result was being streamed. Its statements are re-prepared lazily.
    fn drop_broken(&mut self, endpoint: &Endpoint) {
        info!(endpoint = %endpoint, "replacing broken session");
        self.discard(endpoint);
        if let Some(index) = self.router.index_of(endpoint) {
            self.router.record_failure(index);
        }
        if self.primary.as_ref() == Some(endpoint) {
            self.primary = None;
        }
    }

    /// Fail over away from `endpoint`. Returns the statements that were
    /// prepared on the failed session.
    #[tracing::instrument(level = "info", skip_all, fields(endpoint = %endpoint))]
    fn fail(&mut self, endpoint: &Endpoint, error: &Error) -> Vec<(u64, ServerStatement)> {
        info!(error = %error, mode = %self.mode, "session failed");
        let orphaned = self.discard(endpoint);
        if let Some(index) = self.router.index_of(endpoint) {
            self.router.record_failure(index);
            self.scan_from = index + 1;
        }
        if self.primary.as_ref() == Some(endpoint) {
            self.primary = None;
            if self.mode == HaMode::Aurora {
                self.topology_stale = true;
            }
        }
        if self.current.as_ref() == Some(endpoint) {
            self.current = None;
        }
        orphaned
    }

    fn discard(&mut self, endpoint: &Endpoint) -> Vec<(u64, ServerStatement)> {
        let Some(session) = self.sessions.remove(endpoint) else {
            return Vec::new();
        };
        let orphaned = self.statements.take_session(session.token());
        self.pool.discard(session);
        orphaned
    }

    /// Give a healthy session back to the pool, deallocating our statements
    /// on it first.
    fn release(&mut self, endpoint: &Endpoint) {
        let Some(mut session) = self.sessions.remove(endpoint) else {
            return;
        };
        for (id, server) in self.statements.take_session(session.token()) {
            if session.is_broken() {
                break;
            }
            if let Err(e) = session.close_statement(&server) {
                debug!(statement = id, error = %e, "could not deallocate statement");
            }
        }
        if self.read_only && !self.mode.splits_reads() && !session.is_broken() {
            if let Err(e) = session.query_buffered(read_only_sql(false)) {
                debug!(error = %e, "could not reset transaction mode");
            }
        }
        self.pool.release(session);
    }

    /// Read the Aurora topology through any reachable endpoint and route to
    /// the instances it names.
    fn refresh_topology(&mut self) -> Result<()> {
        let mut last_error = None;
        for index in self.router.candidates(0, any_endpoint) {
            let endpoint = match self.acquire(index) {
                Ok(endpoint) => endpoint,
                Err(e) if e.is_transient() => {
                    self.router.record_failure(index);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(session) = self.sessions.get_mut(&endpoint) else {
                continue;
            };
            match aurora::fetch_topology(session) {
                Ok(topology) => {
                    self.topology_stale = false;
                    match aurora::resolve_endpoints(&self.configured, &topology) {
                        Some(resolved) => {
                            info!(
                                writer = %resolved[0],
                                instances = resolved.len(),
                                "cluster topology resolved"
                            );
                            self.set_endpoints(resolved);
                        }
                        None => warn!("cluster topology names no usable writer"),
                    }
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    self.discard(&endpoint);
                    self.router.record_failure(index);
                    last_error = Some(e);
                }
                Err(e) => {
                    // Not an Aurora server; route over the configured list.
                    warn!(error = %e, "cannot read cluster topology");
                    self.topology_stale = false;
                    return Ok(());
                }
            }
        }
        Err(last_error.unwrap_or_else(|| unavailable("no endpoint available")))
    }

    fn set_endpoints(&mut self, endpoints: Vec<Endpoint>) {
        self.router.set_endpoints(endpoints);
        let stale: Vec<Endpoint> = self
            .sessions
            .keys()
            .filter(|e| self.router.index_of(e).is_none())
            .cloned()
            .collect();
        for endpoint in &stale {
            self.release(endpoint);
        }
        let router = &self.router;
        self.primary = self.primary.take().filter(|e| router.index_of(e).is_some());
        self.current = self.current.take().filter(|e| router.index_of(e).is_some());
        self.scan_from = 0;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Re-prepare statements orphaned by a failover on `session`.
fn rebind(
    session: &mut Session,
    statements: &mut Statements,
    orphaned: &[(u64, ServerStatement)],
) -> Result<()> {
    for (id, old) in orphaned {
        if !statements.contains(*id) || statements.binding(*id, session.token()).is_some() {
            continue;
        }
        let fresh = session.rebind(old)?;
        debug!(statement = id, "statement re-prepared after failover");
        statements.bind(*id, session.token(), fresh);
    }
    Ok(())
}

/// The binding of statement `id` on `session`, preparing it there first if
/// needed.
pub fn bound<'r>(
    statements: &'r mut Statements,
    id: u64,
    session: &mut Session,
) -> Result<&'r ServerStatement> {
    let token = session.token();
    if statements.binding(id, token).is_none() {
        let sql = statements
            .sql(id)
            .ok_or_else(|| Error::InvalidArgument(format!("statement {id} is closed")))?;
        let server = session.prepare(sql)?;
        debug!(statement = id, "statement prepared on session");
        statements.bind(id, token, server);
    }
    statements
        .binding(id, token)
        .ok_or_else(|| Error::InvalidArgument(format!("statement {id} is closed")))
}
