//! One physical connection to one server.
//!
//! A [`Session`] owns its socket. Every packet is read into and framed from
//! its own [`Buffer`]. The session runs the v10 handshake, authenticates, and
//! then dispatches one command at a time. Results come back either as a [`ResultStream`] that decodes one row
//! packet per step or as a fully materialized [`QueryResult`].
//!
//! Any I/O or decode failure leaves the session broken; the pool never takes
//! a broken session back. ERR packets from the server are statement errors
//! and leave the session usable.

// Packet lengths are bounded by the 24-bit header.
#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use marlin_core::{
    Buffer, ColumnInfo, ConnectionError, ConnectionErrorKind, Endpoint, Error, ProtocolError,
    Result, Row, Value,
};
use marlin_pool::PooledSession;
use tracing::{debug, trace, warn};

use crate::auth::{self, AuthPlugin};
use crate::config::SessionConfig;
use crate::protocol::{
    Command, EofPacket, ErrPacket, MAX_PACKET_SIZE, OkPacket, PacketHeader, PacketReader,
    PacketType, PacketWriter, StmtPrepareOk, build_command_packet, build_stmt_close_packet,
    build_stmt_execute_packet, build_stmt_prepare_packet, capabilities, frame,
    parse_stmt_prepare_ok, server_status,
};
use crate::types::{ColumnDef, decode_binary_row, decode_text_row};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Session state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connection established, awaiting handshake
    Connecting,
    /// Performing authentication handshake
    Authenticating,
    /// Ready for commands
    Ready,
    /// An I/O or protocol failure left the stream unusable
    Broken,
    /// COM_QUIT sent
    Closed,
}

/// Initial handshake (protocol v10) as sent by the server.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub capabilities: u32,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin: String,
    /// Scramble, without the trailing NUL
    pub auth_data: Vec<u8>,
    pub charset: u8,
    pub status_flags: u16,
}

impl ServerHandshake {
    /// Parse the initial handshake packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| protocol_error("handshake: missing protocol version"))?;
        if protocol_version != 10 {
            return Err(protocol_error(format!(
                "unsupported protocol version: {}",
                protocol_version
            )));
        }

        let server_version = reader
            .read_null_string()
            .ok_or_else(|| protocol_error("handshake: missing server version"))?;
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| protocol_error("handshake: missing connection id"))?;
        let scramble_1 = reader
            .read_bytes(8)
            .ok_or_else(|| protocol_error("handshake: missing scramble"))?;
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| protocol_error("handshake: missing capability flags"))?;
        let charset = reader.read_u8().unwrap_or(0);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let scramble_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            usize::from(reader.read_u8().unwrap_or(0))
        } else {
            reader.skip(1);
            0
        };
        // Filler, then MariaDB extended capabilities.
        reader.skip(10);

        let mut auth_data = scramble_1.to_vec();
        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = scramble_len.saturating_sub(8).max(13);
            if let Some(rest) = reader.read_bytes(len) {
                let rest = rest.strip_suffix(&[0]).unwrap_or(rest);
                auth_data.extend_from_slice(rest);
            }
        }

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string().unwrap_or_default()
        } else {
            String::new()
        };

        Ok(Self {
            capabilities,
            server_version,
            connection_id,
            auth_plugin: if auth_plugin.is_empty() {
                auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
            } else {
                auth_plugin
            },
            auth_data,
            charset,
            status_flags,
        })
    }
}

/// A statement prepared on one session.
///
/// Carries the token of the session that prepared it; every other session
/// rejects it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatement {
    id: u32,
    session_token: u64,
    sql: String,
    params: Vec<ColumnDef>,
    columns: Vec<ColumnDef>,
}

impl ServerStatement {
    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn session_token(&self) -> u64 {
        self.session_token
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ColumnDef] {
        &self.params
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }
}

/// A fully read result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// One physical connection.
pub struct Session {
    token: u64,
    endpoint: Endpoint,
    stream: TcpStream,
    sequence_id: u8,
    capabilities: u32,
    server_version: String,
    connection_id: u32,
    status_flags: u16,
    state: SessionState,
    pending_result: bool,
    last_used: Instant,
    statements: HashMap<u32, ServerStatement>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("endpoint", &self.endpoint.address())
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction())
            .field("statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect and authenticate.
    ///
    /// 1. Resolve the endpoint and open a TCP connection
    /// 2. Read the server handshake
    /// 3. Send the handshake response
    /// 4. Follow auth switches and extra auth rounds until OK or ERR
    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint))]
    pub fn connect(endpoint: &Endpoint, config: &SessionConfig) -> Result<Self> {
        let stream = open_stream(endpoint, config)?;
        let mut session = Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.clone(),
            stream,
            sequence_id: 0,
            capabilities: 0,
            server_version: String::new(),
            connection_id: 0,
            status_flags: 0,
            state: SessionState::Connecting,
            pending_result: false,
            last_used: Instant::now(),
            statements: HashMap::new(),
        };

        let result = session.handshake(config);
        session.guard(result)?;
        session
            .stream
            .set_read_timeout(config.read_timeout_duration())?;
        session.state = SessionState::Ready;
        debug!(
            connection_id = session.connection_id,
            server_version = %session.server_version,
            "session established"
        );
        Ok(session)
    }

    fn handshake(&mut self, config: &SessionConfig) -> Result<()> {
        let payload = self.read_packet()?;
        if PacketType::of(&payload) == PacketType::Error {
            // Servers refuse early, e.g. "too many connections".
            let err = parse_err(&payload)?;
            return Err(connect_error(format!(
                "server refused connection: {} ({})",
                err.error_message, err.error_code
            )));
        }
        let handshake = ServerHandshake::parse(&payload)?;
        if handshake.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(protocol_error("server does not support protocol 4.1"));
        }
        self.capabilities = config.capability_flags() & handshake.capabilities;
        self.server_version.clone_from(&handshake.server_version);
        self.connection_id = handshake.connection_id;
        self.status_flags = handshake.status_flags;
        self.state = SessionState::Authenticating;

        let plugin =
            AuthPlugin::from_name(&handshake.auth_plugin).unwrap_or(AuthPlugin::NativePassword);
        let response = initial_auth_response(plugin, config, &handshake.auth_data)?;
        self.send_handshake_response(config, plugin, &response)?;
        self.authenticate(config, plugin, handshake.auth_data)
    }

    fn send_handshake_response(
        &mut self,
        config: &SessionConfig,
        plugin: AuthPlugin,
        auth_response: &[u8],
    ) -> Result<()> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::with_capacity(128);
        writer.write_u32_le(caps);
        writer.write_u32_le(MAX_PACKET_SIZE as u32);
        writer.write_u8(config.charset_id()?);
        writer.write_zeros(23);
        writer.write_null_string(&config.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(auth_response);
        } else {
            let len = u8::try_from(auth_response.len()).map_err(|_| {
                protocol_error(format!(
                    "{}-byte auth response needs lenenc client data, which the server did not offer",
                    auth_response.len()
                ))
            })?;
            writer.write_u8(len);
            writer.write_bytes(auth_response);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(config.database.as_deref().unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(plugin.name());
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in &config.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        self.write_packet(writer.as_bytes())
    }

    /// Drive the exchange after the handshake response until OK or ERR.
    fn authenticate(
        &mut self,
        config: &SessionConfig,
        mut plugin: AuthPlugin,
        mut seed: Vec<u8>,
    ) -> Result<()> {
        loop {
            let payload = self.read_packet()?;
            match payload.first().copied() {
                Some(0x00) => {
                    let ok = parse_ok(&payload)?;
                    self.status_flags = ok.status_flags;
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = parse_err(&payload)?;
                    let message = format!(
                        "authentication failed for '{}': {} ({})",
                        config.user, err.error_message, err.error_code
                    );
                    return Err(if err.is_access_denied() {
                        auth_error(message)
                    } else {
                        connect_error(message)
                    });
                }
                Some(0xFE) => {
                    let mut reader = PacketReader::new(&payload[1..]);
                    let name = reader
                        .read_null_string()
                        .ok_or_else(|| protocol_error("auth switch: missing plugin name"))?;
                    let data = reader.read_rest();
                    plugin = AuthPlugin::from_name(&name).ok_or_else(|| {
                        auth_error(format!("unsupported authentication plugin '{}'", name))
                    })?;
                    seed = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
                    debug!(plugin = plugin.name(), "auth switch");
                    let response = initial_auth_response(plugin, config, &seed)?;
                    self.write_packet(&response)?;
                }
                Some(0x01) => match payload.get(1..) {
                    Some([auth::caching_sha2::FAST_AUTH_SUCCESS]) => {
                        trace!("fast authentication succeeded");
                    }
                    Some([auth::caching_sha2::PERFORM_FULL_AUTH]) => {
                        self.full_authentication(config, plugin, &seed)?;
                    }
                    Some(pem) => {
                        let encrypted = auth::encrypt_password(
                            config.password_str(),
                            &seed,
                            pem,
                            plugin.uses_oaep(),
                        )?;
                        self.write_packet(&encrypted)?;
                    }
                    None => return Err(protocol_error("empty extra auth data")),
                },
                Some(other) => {
                    return Err(protocol_error(format!(
                        "unexpected authentication response: 0x{:02X}",
                        other
                    )));
                }
                None => return Err(protocol_error("empty authentication response")),
            }
        }
    }

    /// The server wants the password itself, but the socket is not secure.
    fn full_authentication(
        &mut self,
        config: &SessionConfig,
        plugin: AuthPlugin,
        seed: &[u8],
    ) -> Result<()> {
        if let Some(pem) = &config.server_public_key {
            let encrypted = auth::encrypt_password(
                config.password_str(),
                seed,
                pem.as_bytes(),
                plugin.uses_oaep(),
            )?;
            return self.write_packet(&encrypted);
        }
        if !config.allow_public_key_retrieval {
            return Err(auth_error(
                "full authentication requires the server public key; \
                 set server_public_key or allow_public_key_retrieval",
            ));
        }
        self.write_packet(&[auth::caching_sha2::REQUEST_PUBLIC_KEY])
    }

    /// Process-unique session token.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Negotiated capability flags.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.state, SessionState::Broken | SessionState::Closed)
    }

    /// Ready, no open transaction, no pending result.
    pub fn is_clean(&self) -> bool {
        self.state == SessionState::Ready && !self.in_transaction() && !self.pending_result
    }

    /// Statements currently prepared on this session.
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Mark the session unusable.
    pub fn mark_broken(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Broken;
        }
    }

    /// Shut the socket down without saying goodbye.
    pub fn abort(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.mark_broken();
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal_to_session() && !self.is_broken() {
                warn!(endpoint = %self.endpoint, error = %e, "session broken");
                self.state = SessionState::Broken;
            }
        }
        result
    }

    fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            SessionState::Ready if self.pending_result => {
                self.state = SessionState::Broken;
                Err(protocol_error("previous result was not consumed"))
            }
            SessionState::Ready => {
                self.last_used = Instant::now();
                Ok(())
            }
            state => Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: format!("session to {} is not usable ({:?})", self.endpoint, state),
                source: None,
            })),
        }
    }

    fn check_owner(&self, statement: &ServerStatement) -> Result<()> {
        if statement.session_token != self.token {
            return Err(Error::InvalidArgument(format!(
                "statement {} belongs to session {}, not {}",
                statement.id, statement.session_token, self.token
            )));
        }
        Ok(())
    }

    /// Run a text-protocol statement.
    pub fn query(&mut self, sql: &str) -> Result<ResultStream<'_>> {
        let pending = self.send_query(sql)?;
        Ok(self.stream(pending))
    }

    /// Send a text-protocol statement and read its response header.
    ///
    /// The returned header must be handed to [`Session::stream`] before the
    /// next command; until then the session refuses other work.
    pub fn send_query(&mut self, sql: &str) -> Result<PendingResult> {
        self.ensure_ready()?;
        trace!(sql, "COM_QUERY");
        let packet = build_command_packet(Command::Query, sql.as_bytes())?;
        let result = self
            .send_command(&packet)
            .and_then(|()| self.read_response());
        let (defs, ok) = self.guard(result).map_err(|e| with_sql(e, sql))?;
        Ok(PendingResult {
            defs,
            ok,
            binary: false,
        })
    }

    /// Start reading the rows of a response obtained from
    /// [`Session::send_query`] or [`Session::send_execute`].
    pub fn stream(&mut self, pending: PendingResult) -> ResultStream<'_> {
        ResultStream::new(self, pending)
    }

    /// Run a text-protocol statement and read the whole result.
    pub fn query_buffered(&mut self, sql: &str) -> Result<QueryResult> {
        self.query(sql)?.into_result()
    }

    /// Prepare a statement on this session.
    pub fn prepare(&mut self, sql: &str) -> Result<ServerStatement> {
        self.ensure_ready()?;
        let result = self.prepare_inner(sql);
        let statement = self.guard(result).map_err(|e| with_sql(e, sql))?;
        debug!(
            statement_id = statement.id,
            params = statement.param_count(),
            "prepared statement"
        );
        self.statements.insert(statement.id, statement.clone());
        Ok(statement)
    }

    fn prepare_inner(&mut self, sql: &str) -> Result<ServerStatement> {
        self.send_command(&build_stmt_prepare_packet(sql)?)?;
        let payload = self.read_packet()?;
        if PacketType::of(&payload) == PacketType::Error {
            return Err(parse_err(&payload)?.into_error(Some(sql)));
        }
        let StmtPrepareOk {
            statement_id,
            num_columns,
            num_params,
            ..
        } = parse_stmt_prepare_ok(&payload)
            .ok_or_else(|| malformed("invalid COM_STMT_PREPARE response", &payload))?;
        let params = self.read_column_defs(usize::from(num_params))?;
        let columns = self.read_column_defs(usize::from(num_columns))?;
        Ok(ServerStatement {
            id: statement_id,
            session_token: self.token,
            sql: sql.to_string(),
            params,
            columns,
        })
    }

    /// Prepare `statement`'s SQL on this session.
    pub fn rebind(&mut self, statement: &ServerStatement) -> Result<ServerStatement> {
        self.prepare(&statement.sql)
    }

    /// Execute a prepared statement (binary protocol).
    pub fn execute(
        &mut self,
        statement: &ServerStatement,
        params: &[Value],
    ) -> Result<ResultStream<'_>> {
        let pending = self.send_execute(statement, params)?;
        Ok(self.stream(pending))
    }

    /// Send COM_STMT_EXECUTE and read the response header. See
    /// [`Session::send_query`].
    pub fn send_execute(
        &mut self,
        statement: &ServerStatement,
        params: &[Value],
    ) -> Result<PendingResult> {
        self.check_owner(statement)?;
        if !self.statements.contains_key(&statement.id) {
            return Err(Error::InvalidArgument(format!(
                "statement {} has been closed",
                statement.id
            )));
        }
        if params.len() != statement.param_count() {
            return Err(Error::InvalidArgument(format!(
                "statement expects {} parameters, got {}",
                statement.param_count(),
                params.len()
            )));
        }
        self.ensure_ready()?;
        trace!(statement_id = statement.id, "COM_STMT_EXECUTE");
        let packet = build_stmt_execute_packet(statement.id, params)?;
        let result = self
            .send_command(&packet)
            .and_then(|()| self.read_response());
        let (defs, ok) = self
            .guard(result)
            .map_err(|e| with_sql(e, &statement.sql))?;
        Ok(PendingResult {
            defs,
            ok,
            binary: true,
        })
    }

    /// Execute a prepared statement and read the whole result.
    pub fn execute_buffered(
        &mut self,
        statement: &ServerStatement,
        params: &[Value],
    ) -> Result<QueryResult> {
        self.execute(statement, params)?.into_result()
    }

    /// Deallocate a prepared statement. Closing twice is a no-op.
    pub fn close_statement(&mut self, statement: &ServerStatement) -> Result<()> {
        self.check_owner(statement)?;
        if self.statements.remove(&statement.id).is_none() {
            return Ok(());
        }
        self.ensure_ready()?;
        // COM_STMT_CLOSE has no response.
        let packet = build_stmt_close_packet(statement.id)?;
        let result = self.send_command(&packet);
        self.guard(result)
    }

    /// COM_PING.
    pub fn ping(&mut self) -> Result<()> {
        self.simple_command(Command::Ping, &[])
    }

    /// COM_RESET_CONNECTION: roll back, drop prepared statements and
    /// session variables.
    pub fn reset(&mut self) -> Result<()> {
        self.simple_command(Command::ResetConnection, &[])?;
        self.statements.clear();
        Ok(())
    }

    /// COM_INIT_DB: change the default database.
    pub fn select_database(&mut self, database: &str) -> Result<()> {
        self.simple_command(Command::InitDb, database.as_bytes())
    }

    fn simple_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let packet = build_command_packet(command, payload)?;
        let result = self
            .send_command(&packet)
            .and_then(|()| self.read_packet());
        let payload = self.guard(result)?;
        match PacketType::of(&payload) {
            PacketType::Ok => {
                let result = parse_ok(&payload);
                let ok = self.guard(result)?;
                self.status_flags = ok.status_flags;
                Ok(())
            }
            PacketType::Error => {
                let result = parse_err(&payload);
                Err(self.guard(result)?.into_error(None))
            }
            _ => {
                self.state = SessionState::Broken;
                Err(malformed(format!("unexpected response to {:?}", command), &payload))
            }
        }
    }

    /// Send COM_QUIT and close the socket.
    pub fn close(mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let result = if self.state == SessionState::Ready {
            build_command_packet(Command::Quit, &[]).and_then(|packet| self.send_command(&packet))
        } else {
            Ok(())
        };
        self.state = SessionState::Closed;
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!(endpoint = %self.endpoint, connection_id = self.connection_id, "session closed");
        result
    }

    /// Read the first response to a command.
    ///
    /// Returns the result set's column definitions, empty when the server
    /// answered with OK. ERR becomes a statement error.
    fn read_response(&mut self) -> Result<(Vec<ColumnDef>, OkPacket)> {
        let payload = self.read_packet()?;
        match PacketType::of(&payload) {
            PacketType::Ok => {
                let ok = parse_ok(&payload)?;
                self.status_flags = ok.status_flags;
                if ok.more_results() {
                    self.pending_result = true;
                }
                Ok((Vec::new(), ok))
            }
            PacketType::Error => Err(parse_err(&payload)?.into_error(None)),
            PacketType::LocalInfile => {
                Err(malformed("LOAD DATA LOCAL INFILE is not supported", &payload))
            }
            _ => {
                let mut reader = PacketReader::new(&payload);
                let count = reader
                    .read_lenenc_int()
                    .ok_or_else(|| malformed("invalid column count", &payload))?;
                let count = usize::try_from(count)
                    .map_err(|_| malformed("column count out of range", &payload))?;
                let columns = self.read_column_defs(count)?;
                self.pending_result = true;
                Ok((columns, OkPacket::default()))
            }
        }
    }

    /// Read `count` column definitions and, on classic-EOF servers, the EOF
    /// that follows them.
    fn read_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(ColumnDef::parse(&self.read_packet()?)?);
        }
        if count > 0 && !self.deprecate_eof() {
            let payload = self.read_packet()?;
            if PacketType::of(&payload) != PacketType::Eof {
                return Err(malformed("expected EOF after column definitions", &payload));
            }
        }
        Ok(columns)
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    /// Parse the packet that ends a row sequence and update status.
    fn finish_rows(&mut self, payload: &[u8]) -> Result<(u64, u64, u16)> {
        let (affected, insert_id, status, warnings) = if self.deprecate_eof() {
            let ok = parse_ok(payload)?;
            (ok.affected_rows, ok.last_insert_id, ok.status_flags, ok.warnings)
        } else {
            let EofPacket {
                warnings,
                status_flags,
            } = PacketReader::new(payload)
                .parse_eof_packet()
                .ok_or_else(|| malformed("invalid EOF packet", payload))?;
            (0, 0, status_flags, warnings)
        };
        self.status_flags = status;
        Ok((affected, insert_id, warnings))
    }

    /// Skip any further result sets of a multi-result response.
    ///
    /// An ERR ends the response, so the session is free for the next
    /// command whether or not draining succeeded.
    fn drain_more_results(&mut self) -> Result<()> {
        let result = self.skip_more_results();
        self.pending_result = false;
        if result.is_err() {
            self.status_flags &= !server_status::SERVER_MORE_RESULTS_EXISTS;
        }
        result
    }

    fn skip_more_results(&mut self) -> Result<()> {
        while self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0 {
            let (columns, _) = self.read_response()?;
            if columns.is_empty() {
                continue;
            }
            loop {
                let payload = self.read_packet()?;
                match PacketType::of(&payload) {
                    PacketType::Eof => {
                        self.finish_rows(&payload)?;
                        break;
                    }
                    PacketType::Error => return Err(parse_err(&payload)?.into_error(None)),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Read one logical packet, reassembling payloads split at the 16 MiB
    /// boundary. Fragments are read straight into the returned buffer.
    fn read_packet(&mut self) -> Result<Buffer<'static, u8>> {
        let mut payload = Buffer::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.stream
                .read_exact(&mut header)
                .map_err(|e| disconnected("failed to read packet header", e))?;
            let header = PacketHeader::from_bytes(&header);
            if header.sequence_id != self.sequence_id {
                return Err(protocol_error(format!(
                    "packet out of order: expected sequence {}, got {}",
                    self.sequence_id, header.sequence_id
                )));
            }
            self.sequence_id = header.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            payload.grow(len)?;
            payload
                .fill_from(&mut self.stream, len)
                .map_err(|e| match e {
                    Error::Io(io) => disconnected("failed to read packet payload", io),
                    other => other,
                })?;
            if len < MAX_PACKET_SIZE {
                break;
            }
        }
        trace!(len = payload.len(), seq = self.sequence_id, "read packet");
        Ok(payload)
    }

    /// Write one logical payload at the current sequence id.
    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let (bytes, next) = frame(payload, self.sequence_id)?;
        self.sequence_id = next;
        self.write_bytes(&bytes)
    }

    /// Write a framed command; the sequence restarts with it.
    fn send_command(&mut self, packet: &[u8]) -> Result<()> {
        self.sequence_id = next_sequence(packet);
        self.write_bytes(packet)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| disconnected("failed to write packet", e))
    }
}

impl PooledSession for Session {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_clean(&self) -> bool {
        Session::is_clean(self)
    }

    fn is_usable(&self) -> bool {
        !self.is_broken()
    }

    fn last_used(&self) -> Instant {
        self.last_used
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn validate(&mut self) -> bool {
        self.ping().is_ok()
    }

    fn close(self) {
        if let Err(e) = Session::close(self) {
            debug!(error = %e, "error while closing session");
        }
    }
}

/// Response header of a command whose rows have not been read yet.
#[must_use = "a pending result keeps the session busy until it is streamed"]
#[derive(Debug)]
pub struct PendingResult {
    defs: Vec<ColumnDef>,
    ok: OkPacket,
    binary: bool,
}

impl PendingResult {
    /// Column definitions, empty when the server answered with OK.
    pub fn column_defs(&self) -> &[ColumnDef] {
        &self.defs
    }
}

/// Rows of one result, decoded one packet at a time.
///
/// Dropping an unfinished stream reads and discards the remaining rows so
/// the session can take the next command.
pub struct ResultStream<'s> {
    session: &'s mut Session,
    defs: Vec<ColumnDef>,
    columns: Arc<ColumnInfo>,
    binary: bool,
    done: bool,
    /// Error from a trailing result, returned by the next read.
    deferred: Option<Error>,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
}

impl fmt::Debug for ResultStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("columns", &self.columns.names())
            .field("binary", &self.binary)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'s> ResultStream<'s> {
    fn new(session: &'s mut Session, pending: PendingResult) -> Self {
        let PendingResult { defs, ok, binary } = pending;
        let columns = Arc::new(ColumnInfo::new(
            defs.iter().map(|c| c.name.clone()).collect(),
        ));
        let mut stream = Self {
            session,
            done: defs.is_empty(),
            defs,
            columns,
            binary,
            deferred: None,
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
        };
        if stream.done {
            let result = stream.session.drain_more_results();
            stream.deferred = stream.session.guard(result).err();
        }
        stream
    }

    /// Column definitions of this result (empty for OK responses).
    pub fn column_defs(&self) -> &[ColumnDef] {
        &self.defs
    }

    pub fn columns(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Rows affected; known once the stream is exhausted.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn is_done(&self) -> bool {
        self.done && self.deferred.is_none()
    }

    /// Read the next row, `None` at the end of the result.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        if self.done {
            return Ok(None);
        }
        let result = self.read_row();
        if result.is_err() {
            self.done = true;
            self.session.pending_result = false;
        }
        self.session.guard(result)
    }

    fn read_row(&mut self) -> Result<Option<Row>> {
        let payload = self.session.read_packet()?;
        match PacketType::of(&payload) {
            PacketType::Eof => {
                let (affected, insert_id, warnings) = self.session.finish_rows(&payload)?;
                self.affected_rows = affected;
                self.last_insert_id = insert_id;
                self.warnings = warnings;
                self.done = true;
                self.session.drain_more_results()?;
                Ok(None)
            }
            PacketType::Error => Err(parse_err(&payload)?.into_error(None)),
            _ => {
                let values = if self.binary {
                    decode_binary_row(&self.defs, &payload)?
                } else {
                    decode_text_row(&self.defs, &payload)?
                };
                Ok(Some(Row::with_columns(Arc::clone(&self.columns), values)))
            }
        }
    }

    /// Read every remaining row.
    pub fn into_result(mut self) -> Result<QueryResult> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(QueryResult {
            columns: std::mem::take(&mut self.defs),
            rows,
            affected_rows: self.affected_rows,
            last_insert_id: self.last_insert_id,
            warnings: self.warnings,
        })
    }

    /// Discard the remaining rows.
    pub fn drain(&mut self) -> Result<()> {
        while self.next_row()?.is_some() {}
        Ok(())
    }
}

impl Iterator for ResultStream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for ResultStream<'_> {
    fn drop(&mut self) {
        if let Some(e) = self.deferred.take() {
            debug!(error = %e, "dropped result with an unread error");
        }
        if !self.done {
            if let Err(e) = self.drain() {
                debug!(error = %e, "error while draining result");
            }
        }
    }
}

fn initial_auth_response(
    plugin: AuthPlugin,
    config: &SessionConfig,
    seed: &[u8],
) -> Result<Vec<u8>> {
    let password = config.password_str();
    match (plugin, &config.server_public_key) {
        (AuthPlugin::Sha256, Some(pem)) if !password.is_empty() => {
            auth::encrypt_password(password, seed, pem.as_bytes(), false)
        }
        _ => Ok(plugin.initial_response(password, seed)),
    }
}

/// Resolve and connect, trying each resolved address in turn.
fn open_stream(endpoint: &Endpoint, config: &SessionConfig) -> Result<TcpStream> {
    let address = endpoint.address();
    let addrs: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("cannot resolve {}: {}", address, e),
                source: Some(Box::new(e)),
            })
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout_duration()) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(config.connect_timeout_duration()))?;
                stream.set_write_timeout(Some(config.connect_timeout_duration()))?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => {
            let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("failed to connect to {}: {}", address, e),
                source: Some(Box::new(e)),
            })
        }
        None => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("{} resolved to no addresses", address),
            source: None,
        }),
    })
}

/// Sequence id following the last header of a framed packet.
fn next_sequence(framed: &[u8]) -> u8 {
    let mut pos = 0;
    let mut next = 0u8;
    while let Some(header) = framed.get(pos..pos + PacketHeader::SIZE) {
        let header = PacketHeader::from_bytes(&[header[0], header[1], header[2], header[3]]);
        next = header.sequence_id.wrapping_add(1);
        pos += PacketHeader::SIZE + header.payload_length as usize;
    }
    next
}

fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    PacketReader::new(payload)
        .parse_ok_packet()
        .ok_or_else(|| malformed("invalid OK packet", payload))
}

fn parse_err(payload: &[u8]) -> Result<ErrPacket> {
    PacketReader::new(payload)
        .parse_err_packet()
        .ok_or_else(|| malformed("invalid ERR packet", payload))
}

fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(mut q) if q.sql.is_none() => {
            q.sql = Some(sql.to_string());
            Error::Query(q)
        }
        other => other,
    }
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
    })
}

fn malformed(msg: impl Into<String>, raw: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: Some(raw.to_vec()),
    })
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}

fn connect_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: msg.into(),
        source: None,
    })
}

fn disconnected(context: &str, err: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("{}: {}", context, err),
        source: Some(Box::new(err)),
    })
}
