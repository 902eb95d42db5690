//! A scripted MariaDB server for integration tests.
//!
//! Each [`FakeServer`] listens on a loopback port and speaks enough of the
//! client/server protocol for a real [`marlin_mariadb::Session`]: the v10
//! handshake with `mysql_native_password`, classic EOF result sets, text
//! queries and prepared statements. Every result row starts with the
//! server's name so tests can tell where a statement ran.
//!
//! Scripted behaviour:
//! - `SELECT ...` returns columns `server, query` with one row
//! - queries naming `replica_host_status` return the configured topology
//! - `START TRANSACTION` / `COMMIT` / `ROLLBACK` toggle `IN_TRANS`
//! - SQL starting with `FAIL` is answered with ERR 1064
//! - `CALL ...` answers OK with more results pending, then ERR 1644
//! - queries naming `stream_until_cut` send one row and then stall until
//!   the connection is cut
//! - anything else is answered with OK

#![allow(dead_code)]

use marlin::Endpoint;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

const CLIENT_LONG_PASSWORD: u32 = 1;
const CLIENT_LONG_FLAG: u32 = 1 << 2;
const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
const CLIENT_PROTOCOL_41: u32 = 1 << 9;
const CLIENT_TRANSACTIONS: u32 = 1 << 13;
const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;

const SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

const STATUS_IN_TRANS: u16 = 0x0001;
const STATUS_AUTOCOMMIT: u16 = 0x0002;
const STATUS_MORE_RESULTS: u16 = 0x0008;

const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;
const COM_RESET_CONNECTION: u8 = 0x1f;

const TYPE_VAR_STRING: u8 = 0xFD;

/// One entry of the scripted Aurora topology.
#[derive(Debug, Clone)]
pub struct Replica {
    pub server_id: String,
    pub writer: bool,
}

impl Replica {
    pub fn writer(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            writer: true,
        }
    }

    pub fn reader(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            writer: false,
        }
    }
}

struct Shared {
    name: String,
    stopped: AtomicBool,
    reject_auth: AtomicBool,
    next_connection_id: AtomicU32,
    handshakes: AtomicUsize,
    prepares: AtomicUsize,
    log: Mutex<Vec<String>>,
    clients: Mutex<Vec<TcpStream>>,
    topology: Mutex<Vec<Replica>>,
}

/// An in-process server on `127.0.0.1`.
pub struct FakeServer {
    port: u16,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
}

impl FakeServer {
    pub fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(Shared {
            name: name.to_string(),
            stopped: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
            next_connection_id: AtomicU32::new(1),
            handshakes: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            topology: Mutex::new(Vec::new()),
        });
        let accept_shared = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name(format!("fake-{name}"))
            .spawn(move || accept_loop(&listener, &accept_shared))
            .expect("spawn acceptor");
        Self {
            port,
            shared,
            acceptor: Some(acceptor),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A writer endpoint for this server.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    /// `host:port`, the form used as an Aurora `SERVER_ID`.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Answer every login with "access denied".
    pub fn reject_auth(&self) {
        self.shared.reject_auth.store(true, Ordering::SeqCst);
    }

    pub fn set_topology(&self, replicas: Vec<Replica>) {
        *self.shared.topology.lock().unwrap() = replicas;
    }

    /// Completed logins.
    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    /// COM_STMT_PREPARE commands received.
    pub fn prepares(&self) -> usize {
        self.shared.prepares.load(Ordering::SeqCst)
    }

    /// Text queries and executed statement SQL, in arrival order.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    /// How many logged statements contain `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.log().iter().filter(|sql| sql.contains(needle)).count()
    }

    /// Cut every client connection but keep listening.
    pub fn drop_connections(&self) {
        for client in self.shared.clients.lock().unwrap().drain(..) {
            let _ = client.shutdown(Shutdown::Both);
        }
    }

    /// Stop listening and cut every client connection.
    pub fn kill(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.drop_connections();
        if let Some(acceptor) = self.acceptor.take() {
            // Wake the blocking accept.
            let _ = TcpStream::connect(("127.0.0.1", self.port));
            let _ = acceptor.join();
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.kill();
    }
}

/// An endpoint nothing listens on.
pub fn dead_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else {
            continue;
        };
        if let Ok(clone) = stream.try_clone() {
            shared.clients.lock().unwrap().push(clone);
        }
        let shared = Arc::clone(shared);
        thread::spawn(move || {
            let mut client = Client::new(stream, shared);
            let _ = client.run();
        });
    }
}

struct Client {
    stream: TcpStream,
    shared: Arc<Shared>,
    seq: u8,
    in_transaction: bool,
    statements: HashMap<u32, String>,
    next_statement: u32,
}

impl Client {
    fn new(stream: TcpStream, shared: Arc<Shared>) -> Self {
        Self {
            stream,
            shared,
            seq: 0,
            in_transaction: false,
            statements: HashMap::new(),
            next_statement: 1,
        }
    }

    fn run(&mut self) -> io::Result<()> {
        if !self.login()? {
            return Ok(());
        }
        loop {
            let packet = self.read()?;
            let Some((&command, body)) = packet.split_first() else {
                return Ok(());
            };
            self.seq = 1;
            match command {
                COM_QUIT => return Ok(()),
                COM_QUERY => self.query(&String::from_utf8_lossy(body))?,
                COM_PING | COM_INIT_DB => self.ok(0)?,
                COM_RESET_CONNECTION => {
                    self.statements.clear();
                    self.in_transaction = false;
                    self.ok(0)?;
                }
                COM_STMT_PREPARE => self.prepare(&String::from_utf8_lossy(body))?,
                COM_STMT_EXECUTE => self.execute(body)?,
                COM_STMT_CLOSE => {
                    if let Some(id) = body.get(..4) {
                        let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
                        self.statements.remove(&id);
                    }
                }
                other => self.err(1047, "08S01", &format!("unknown command 0x{other:02x}"))?,
            }
        }
    }

    fn login(&mut self) -> io::Result<bool> {
        let connection_id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let mut p = vec![10u8];
        p.extend_from_slice(b"10.6.0-MariaDB-fake\0");
        p.extend_from_slice(&connection_id.to_le_bytes());
        p.extend_from_slice(b"abcdefgh");
        p.push(0);
        p.extend_from_slice(&(SERVER_CAPABILITIES as u16).to_le_bytes());
        p.push(45);
        p.extend_from_slice(&STATUS_AUTOCOMMIT.to_le_bytes());
        p.extend_from_slice(&((SERVER_CAPABILITIES >> 16) as u16).to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0; 10]);
        p.extend_from_slice(b"ijklmnopqrst\0");
        p.extend_from_slice(b"mysql_native_password\0");
        self.seq = 0;
        self.write(&p)?;

        // Handshake response; the scramble is not checked.
        self.read()?;
        if self.shared.reject_auth.load(Ordering::SeqCst) {
            self.err(1045, "28000", "Access denied for user")?;
            return Ok(false);
        }
        self.ok(0)?;
        self.shared.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn status(&self) -> u16 {
        if self.in_transaction {
            STATUS_AUTOCOMMIT | STATUS_IN_TRANS
        } else {
            STATUS_AUTOCOMMIT
        }
    }

    fn record(&self, sql: &str) {
        self.shared.log.lock().unwrap().push(sql.to_string());
    }

    fn query(&mut self, sql: &str) -> io::Result<()> {
        self.record(sql);
        let upper = sql.trim().to_ascii_uppercase();
        if upper.starts_with("FAIL") {
            return self.err(1064, "42000", "You have an error in your SQL syntax");
        }
        if upper.starts_with("CALL") {
            self.ok_with_status(0, self.status() | STATUS_MORE_RESULTS)?;
            return self.err(1644, "45000", "Signal raised by procedure");
        }
        if sql.contains("stream_until_cut") {
            return self.stall_after_first_row(sql);
        }
        if sql.contains("replica_host_status") {
            let rows: Vec<Vec<String>> = self
                .shared
                .topology
                .lock()
                .unwrap()
                .iter()
                .map(|r| {
                    let session = if r.writer {
                        "MASTER_SESSION_ID"
                    } else {
                        "replica-session"
                    };
                    vec![r.server_id.clone(), session.to_string()]
                })
                .collect();
            return self.text_result(&["SERVER_ID", "SESSION_ID"], &rows);
        }
        if upper.starts_with("START TRANSACTION") || upper.starts_with("BEGIN") {
            self.in_transaction = true;
            return self.ok(0);
        }
        if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            self.in_transaction = false;
            return self.ok(0);
        }
        if upper.starts_with("SELECT") {
            let row = vec![self.shared.name.clone(), sql.to_string()];
            return self.text_result(&["server", "query"], &[row]);
        }
        self.ok(1)
    }

    fn prepare(&mut self, sql: &str) -> io::Result<()> {
        self.shared.prepares.fetch_add(1, Ordering::SeqCst);
        if sql.trim().to_ascii_uppercase().starts_with("FAIL") {
            return self.err(1064, "42000", "You have an error in your SQL syntax");
        }
        let id = self.next_statement;
        self.next_statement += 1;
        self.statements.insert(id, sql.to_string());
        let params = sql.matches('?').count() as u16;

        let mut p = vec![0u8];
        p.extend_from_slice(&id.to_le_bytes());
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&params.to_le_bytes());
        p.push(0);
        p.extend_from_slice(&0u16.to_le_bytes());
        self.write(&p)?;

        if params > 0 {
            for i in 0..params {
                self.write(&column_definition(&format!("?{i}")))?;
            }
            self.eof()?;
        }
        self.write(&column_definition("server"))?;
        self.write(&column_definition("query"))?;
        self.eof()
    }

    fn execute(&mut self, body: &[u8]) -> io::Result<()> {
        let Some(id) = body.get(..4) else {
            return self.err(1243, "HY000", "Unknown prepared statement handler");
        };
        let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
        let Some(sql) = self.statements.get(&id).cloned() else {
            return self.err(1243, "HY000", "Unknown prepared statement handler");
        };
        self.record(&sql);

        self.write(&[2])?;
        self.write(&column_definition("server"))?;
        self.write(&column_definition("query"))?;
        self.eof()?;
        // 0x00 header, NULL bitmap for two columns, two strings.
        let mut row = vec![0u8, 0u8];
        lenenc_str(&mut row, &self.shared.name);
        lenenc_str(&mut row, &sql);
        self.write(&row)?;
        self.eof()
    }

    fn text_result(&mut self, columns: &[&str], rows: &[Vec<String>]) -> io::Result<()> {
        self.write(&[columns.len() as u8])?;
        for column in columns {
            self.write(&column_definition(column))?;
        }
        self.eof()?;
        for row in rows {
            let mut p = Vec::new();
            for value in row {
                lenenc_str(&mut p, value);
            }
            self.write(&p)?;
        }
        self.eof()
    }

    fn stall_after_first_row(&mut self, sql: &str) -> io::Result<()> {
        self.write(&[2])?;
        self.write(&column_definition("server"))?;
        self.write(&column_definition("query"))?;
        self.eof()?;
        let mut row = Vec::new();
        lenenc_str(&mut row, &self.shared.name);
        lenenc_str(&mut row, sql);
        self.write(&row)?;
        // The client sends nothing mid-result; this returns once cut.
        let mut byte = [0u8; 1];
        let _ = self.stream.read(&mut byte);
        Err(io::ErrorKind::ConnectionAborted.into())
    }

    fn ok(&mut self, affected: u8) -> io::Result<()> {
        self.ok_with_status(affected, self.status())
    }

    fn ok_with_status(&mut self, affected: u8, status: u16) -> io::Result<()> {
        let mut p = vec![0x00, affected, 0x00];
        p.extend_from_slice(&status.to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        self.write(&p)
    }

    fn eof(&mut self) -> io::Result<()> {
        let mut p = vec![0xFE];
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&self.status().to_le_bytes());
        self.write(&p)
    }

    fn err(&mut self, code: u16, state: &str, message: &str) -> io::Result<()> {
        let mut p = vec![0xFF];
        p.extend_from_slice(&code.to_le_bytes());
        p.push(b'#');
        p.extend_from_slice(state.as_bytes());
        p.extend_from_slice(message.as_bytes());
        self.write(&p)
    }

    fn read(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        self.seq = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = payload.len() as u32;
        let mut packet = Vec::with_capacity(payload.len() + 4);
        packet.extend_from_slice(&len.to_le_bytes()[..3]);
        packet.push(self.seq);
        packet.extend_from_slice(payload);
        self.seq = self.seq.wrapping_add(1);
        self.stream.write_all(&packet)?;
        self.stream.flush()
    }
}

fn lenenc_str(out: &mut Vec<u8>, value: &str) {
    let len = value.len();
    if len < 251 {
        out.push(len as u8);
    } else {
        out.push(0xFC);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    }
    out.extend_from_slice(value.as_bytes());
}

fn column_definition(name: &str) -> Vec<u8> {
    let mut p = Vec::new();
    for part in ["def", "fake", "t", "t", name, name] {
        lenenc_str(&mut p, part);
    }
    p.push(0x0c);
    p.extend_from_slice(&45u16.to_le_bytes());
    p.extend_from_slice(&1024u32.to_le_bytes());
    p.push(TYPE_VAR_STRING);
    p.extend_from_slice(&0u16.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&[0, 0]);
    p
}
