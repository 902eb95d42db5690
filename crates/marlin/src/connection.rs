//! Logical connections and the data source that hands them out.

use crate::ha::HaMode;
use crate::listener::{self, Listener, Route, SessionPool};
use crate::statement::Statement;
use marlin_core::{ConfigError, Endpoint, Error, Result, Value, map_hash};
use marlin_mariadb::{MariaDbConnector, QueryResult, ResultStream, SessionConfig};
use marlin_pool::{Pool, PoolConfig, PoolRegistry, PoolStats};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long a blacklisted endpoint is skipped, in milliseconds.
pub const DEFAULT_BLACKLIST_BACKOFF_MS: u64 = 50_000;

fn registry() -> &'static PoolRegistry<MariaDbConnector> {
    static REGISTRY: OnceLock<PoolRegistry<MariaDbConnector>> = OnceLock::new();
    REGISTRY.get_or_init(PoolRegistry::new)
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
    })
}

/// Everything needed to open logical connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Servers, in scan order
    pub endpoints: Vec<Endpoint>,
    /// Failover and routing policy
    pub ha_mode: HaMode,
    /// Credentials and per-session options
    pub session: SessionConfig,
    /// Pool limits, shared by every endpoint
    pub pool: PoolConfig,
    /// Consecutive failures tolerated before an endpoint is blacklisted
    pub failure_threshold: u32,
    /// Blacklist duration in milliseconds
    pub blacklist_backoff_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            ha_mode: HaMode::None,
            session: SessionConfig::default(),
            pool: PoolConfig::default(),
            failure_threshold: 0,
            blacklist_backoff_ms: DEFAULT_BLACKLIST_BACKOFF_MS,
        }
    }
}

impl ConnectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an endpoint.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Replace the endpoint list.
    pub fn endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn ha_mode(mut self, mode: HaMode) -> Self {
        self.ha_mode = mode;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn blacklist_backoff(mut self, ms: u64) -> Self {
        self.blacklist_backoff_ms = ms;
        self
    }

    pub fn blacklist_backoff_duration(&self) -> Duration {
        Duration::from_millis(self.blacklist_backoff_ms)
    }

    /// Check the configuration before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(config_error("at least one endpoint is required"));
        }
        if let Some(endpoint) = self.endpoints.iter().find(|e| e.host.is_empty()) {
            return Err(config_error(format!("endpoint {endpoint} has no host")));
        }
        if self.ha_mode.splits_reads()
            && self.ha_mode != HaMode::Aurora
            && !self.endpoints.iter().any(Endpoint::is_writer)
        {
            return Err(config_error(format!(
                "{} mode needs at least one writer endpoint",
                self.ha_mode
            )));
        }
        if self.ha_mode == HaMode::None && self.endpoints.len() > 1 {
            warn!(
                endpoints = self.endpoints.len(),
                "HA mode 'none' only uses the first endpoint"
            );
        }
        self.session.charset_id()?;
        self.pool.validate()
    }

    /// Order-independent hash of every option, used to share pools.
    pub fn fingerprint(&self) -> Result<u64> {
        let value = serde_json::to_value(self)
            .map_err(|e| config_error(format!("cannot fingerprint configuration: {e}")))?;
        let serde_json::Value::Object(fields) = value else {
            return Err(config_error("configuration did not serialize to a map"));
        };
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        Ok(map_hash(fields.iter().map(|(k, v)| (k, v))))
    }
}

/// Factory of logical connections sharing one pool.
///
/// Data sources built from equal configurations share the same pool.
#[derive(Debug)]
pub struct DataSource {
    config: ConnectConfig,
    fingerprint: u64,
    pool: Arc<SessionPool>,
}

impl DataSource {
    pub fn new(config: ConnectConfig) -> Result<Self> {
        config.validate()?;
        let fingerprint = config.fingerprint()?;
        let pool = registry().get_or_create(fingerprint, || {
            Pool::with_evictor(
                MariaDbConnector::new(config.session.clone()),
                config.pool.clone(),
            )
        })?;
        debug!(fingerprint, mode = %config.ha_mode, "data source ready");
        Ok(Self {
            config,
            fingerprint,
            pool,
        })
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Open a logical connection.
    pub fn get_connection(&self) -> Result<Connection> {
        let listener = Listener::open(
            self.config.ha_mode,
            self.config.endpoints.clone(),
            Arc::clone(&self.pool),
            self.config.failure_threshold,
            self.config.blacklist_backoff_duration(),
        )?;
        Ok(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            listener,
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shut the shared pool down. Open connections keep their sessions
    /// until they close; new connections get a fresh pool.
    pub fn shutdown(&self) {
        if !registry().remove(self.fingerprint) {
            self.pool.shutdown();
        }
    }
}

/// A logical connection: one caller-facing handle over however many
/// physical sessions the HA mode needs.
///
/// Every call takes `&mut self`; a connection runs one operation at a time.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    listener: Listener,
}

impl Connection {
    /// Open a connection without building a [`DataSource`] first.
    pub fn open(
        endpoints: Vec<Endpoint>,
        ha_mode: HaMode,
        credentials: SessionConfig,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        let config = ConnectConfig::new()
            .endpoints(endpoints)
            .ha_mode(ha_mode)
            .session(credentials)
            .pool(pool_config);
        DataSource::new(config)?.get_connection()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ha_mode(&self) -> HaMode {
        self.listener.mode()
    }

    /// Endpoint that ran the last operation.
    pub fn current_endpoint(&self) -> Option<&Endpoint> {
        self.listener.current_endpoint()
    }

    /// Endpoints being routed to; for AURORA, the discovered instances.
    pub fn endpoints(&self) -> &[Endpoint] {
        self.listener.endpoints()
    }

    pub fn in_transaction(&self) -> bool {
        self.listener.in_transaction()
    }

    pub fn is_read_only(&self) -> bool {
        self.listener.is_read_only()
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_closed()
    }

    fn route(&self, read_only: bool) -> Route {
        if read_only || self.listener.is_read_only() {
            Route::Read
        } else {
            Route::Write
        }
    }

    /// Prepare a statement that may modify data.
    pub fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.prepare_with(sql, false)
    }

    /// Prepare a statement that is safe to run on a reader.
    pub fn prepare_read_only(&mut self, sql: &str) -> Result<Statement> {
        self.prepare_with(sql, true)
    }

    fn prepare_with(&mut self, sql: &str, read_only: bool) -> Result<Statement> {
        let route = self.route(read_only);
        let (id, param_count) = self.listener.run(route, |session, statements| {
            let server = session.prepare(sql)?;
            let param_count = server.param_count();
            let id = statements.register(sql, read_only);
            statements.bind(id, session.token(), server);
            Ok((id, param_count))
        })?;
        Ok(Statement {
            id,
            owner: self.id,
            read_only,
            param_count,
        })
    }

    fn check(&self, statement: &Statement, params: &[Value]) -> Result<()> {
        if statement.owner != self.id {
            return Err(Error::InvalidArgument(format!(
                "statement {} belongs to connection {}",
                statement.id, statement.owner
            )));
        }
        if !self.listener.statements().contains(statement.id) {
            return Err(Error::InvalidArgument(format!(
                "statement {} is closed",
                statement.id
            )));
        }
        if params.len() != statement.param_count {
            return Err(Error::InvalidArgument(format!(
                "statement expects {} parameters, got {}",
                statement.param_count,
                params.len()
            )));
        }
        Ok(())
    }

    /// Execute a prepared statement and stream its rows.
    ///
    /// Failures before the first row fail over; failures while rows are
    /// streamed are returned, and the session is replaced on the next call.
    pub fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<ResultStream<'_>> {
        self.check(statement, params)?;
        let route = self.route(statement.read_only);
        let pending = self.listener.run(route, |session, statements| {
            let server = listener::bound(statements, statement.id, session)?;
            session.send_execute(server, params)
        })?;
        Ok(self.listener.current_session()?.stream(pending))
    }

    /// Execute a prepared statement and read the whole result. The read is
    /// covered by failover.
    pub fn execute_buffered(&mut self, statement: &Statement, params: &[Value]) -> Result<QueryResult> {
        self.check(statement, params)?;
        let route = self.route(statement.read_only);
        self.listener.run(route, |session, statements| {
            let server = listener::bound(statements, statement.id, session)?;
            session.execute_buffered(server, params)
        })
    }

    /// Run SQL text and stream its rows.
    pub fn query(&mut self, sql: &str) -> Result<ResultStream<'_>> {
        let route = self.route(false);
        let pending = self.listener.run(route, |session, _| session.send_query(sql))?;
        Ok(self.listener.current_session()?.stream(pending))
    }

    /// Run SQL text and read the whole result.
    pub fn query_buffered(&mut self, sql: &str) -> Result<QueryResult> {
        let route = self.route(false);
        self.listener
            .run(route, |session, _| session.query_buffered(sql))
    }

    pub fn begin(&mut self) -> Result<()> {
        self.listener
            .run(Route::Write, |session, _| session.query_buffered("START TRANSACTION"))
            .map(drop)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.listener
            .run(Route::Write, |session, _| session.query_buffered("COMMIT"))
            .map(drop)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.listener
            .run(Route::Write, |session, _| session.query_buffered("ROLLBACK"))
            .map(drop)
    }

    /// Mark the connection read-only. With REPLICATION and AURORA this
    /// sends text queries to readers; other modes switch the server-side
    /// transaction mode.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.listener.set_read_only(read_only)
    }

    pub fn ping(&mut self) -> Result<()> {
        self.listener.run(Route::Write, |session, _| session.ping())
    }

    /// Deallocate a statement everywhere it is prepared. Closing twice is a
    /// no-op.
    pub fn close_statement(&mut self, statement: &Statement) -> Result<()> {
        if statement.owner != self.id {
            return Err(Error::InvalidArgument(format!(
                "statement {} belongs to connection {}",
                statement.id, statement.owner
            )));
        }
        self.listener.close_statement(statement.id);
        Ok(())
    }

    /// Deallocate statements and return every session to the pool.
    pub fn close(mut self) -> Result<()> {
        self.listener.close();
        Ok(())
    }
}
