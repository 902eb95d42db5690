//! MariaDB client/server wire protocol.
//!
//! Every packet starts with a 4-byte header: a 3-byte little-endian payload
//! length and a 1-byte sequence number. A payload of `2^24 - 1` bytes or more
//! is split across several packets; a chunk of exactly the maximum size is
//! always followed by another packet, possibly empty.

pub mod prepared;
pub mod reader;
pub mod writer;

pub use prepared::{
    StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::{PacketWriter, build_command_packet, frame};

use marlin_core::{Error, QueryError, QueryErrorKind};

/// Maximum payload size for a single packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags (client and server).
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities this client asks for. The effective set is the
    /// intersection with what the server advertises.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;
}

/// Command bytes (COM_xxx) this client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    ResetConnection = 0x1f,
}

/// Server status flags.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
}

/// Character set / collation ids.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;

    /// Collation sent in the handshake response.
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;

    /// Look up a collation id by charset or collation name.
    pub fn from_name(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "latin1" | "latin1_swedish_ci" => Some(LATIN1_SWEDISH_CI),
            "utf8" | "utf8mb3" | "utf8_general_ci" => Some(UTF8_GENERAL_CI),
            "utf8mb4" | "utf8mb4_general_ci" => Some(UTF8MB4_GENERAL_CI),
            "utf8mb4_unicode_ci" => Some(UTF8MB4_UNICODE_CI),
            "binary" => Some(BINARY),
            _ => None,
        }
    }
}

/// A packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Kind of a server response, from its first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ok,
    Error,
    /// `0xFE` with a short payload. With `CLIENT_DEPRECATE_EOF` this marker
    /// carries an OK body instead.
    Eof,
    LocalInfile,
    Data,
}

impl PacketType {
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 0xFF_FF_FF => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Classify a payload. Empty payloads are data.
    pub fn of(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(PacketType::Data, |b| Self::from_first_byte(*b, payload.len()))
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQLSTATE (5 characters), empty before the handshake completes
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// ER_DUP_ENTRY
    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }

    /// ER_ROW_IS_REFERENCED_2 / ER_NO_REFERENCED_ROW_2
    pub fn is_foreign_key_violation(&self) -> bool {
        self.error_code == 1451 || self.error_code == 1452
    }

    /// Access denied errors seen during authentication.
    pub fn is_access_denied(&self) -> bool {
        matches!(self.error_code, 1044 | 1045 | 1698)
    }

    /// Convert into a statement error.
    pub fn into_error(self, sql: Option<&str>) -> Error {
        let kind = match self.error_code {
            1062 | 1451 | 1452 | 1048 | 1364 => QueryErrorKind::Constraint,
            1064 | 1149 => QueryErrorKind::Syntax,
            1243 => QueryErrorKind::UnknownStatement,
            1213 => QueryErrorKind::Deadlock,
            _ if self.sql_state.starts_with("23") => QueryErrorKind::Constraint,
            _ if self.sql_state.starts_with("42") => QueryErrorKind::Syntax,
            _ => QueryErrorKind::Database,
        };
        Error::Query(QueryError {
            kind,
            sql: sql.map(str::to_string),
            sqlstate: (!self.sql_state.is_empty()).then_some(self.sql_state),
            code: Some(self.error_code),
            message: self.error_message,
        })
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}
