//! MariaDB/MySQL wire protocol sessions for Marlin.
//!
//! This crate speaks the client/server protocol over a blocking
//! `TcpStream`. It provides:
//!
//! - Packet framing with sequence numbers and 16 MiB payload splitting
//! - Authentication (mysql_native_password, caching_sha2_password including
//!   RSA full authentication, sha256_password, mysql_clear_password)
//! - Text and binary result decoding, classic EOF and `CLIENT_DEPRECATE_EOF`
//! - Prepared statements bound to the session that created them
//! - Streaming and buffered result delivery
//! - A [`MariaDbConnector`] so sessions can live in a `marlin_pool::Pool`
//!
//! # Example
//!
//! ```rust,ignore
//! use marlin_core::Endpoint;
//! use marlin_mariadb::{Session, SessionConfig};
//!
//! let config = SessionConfig::new().user("app").password("secret").database("shop");
//! let mut session = Session::connect(&Endpoint::new("db1", 3306), &config)?;
//! let result = session.query_buffered("SELECT 1")?;
//! ```

pub mod auth;
pub mod config;
pub mod connector;
pub mod protocol;
pub mod session;
pub mod types;

pub use auth::AuthPlugin;
pub use config::SessionConfig;
pub use connector::MariaDbConnector;
pub use session::{
    PendingResult, QueryResult, ResultStream, ServerStatement, Session, SessionState,
};
pub use types::{ColumnDef, FieldType};
