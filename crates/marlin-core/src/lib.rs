//! Core types for Marlin.
//!
//! This crate holds the pieces shared by every layer of the connector:
//!
//! - `Buffer` for owned or borrowed protocol I/O buffers
//! - `Error` taxonomy and the `Result` alias
//! - `Value` and `Row` for statement parameters and decoded rows
//! - `Endpoint` and `Role` describing servers
//! - `map_hash` for order-invariant fingerprints of option maps

pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod hash;
pub mod row;
pub mod value;

pub use buffer::Buffer;
pub use endpoint::{DEFAULT_PORT, Endpoint, Role};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind,
    ProtocolError, QueryError, QueryErrorKind, Result,
};
pub use hash::map_hash;
pub use row::{ColumnInfo, Row};
pub use value::Value;
