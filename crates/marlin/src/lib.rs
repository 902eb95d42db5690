//! Marlin - a high-availability MariaDB/MySQL connector.
//!
//! Marlin gives an application one logical [`Connection`] over one server or
//! a cluster of them, providing:
//!
//! - Pooled physical sessions shared between connections with equal options
//! - Five HA modes: none, sequential, loadbalance, replication and aurora
//! - Transparent failover with a single retry on transient network errors
//! - Prepared statements that survive failover
//! - Read/write splitting for replicated topologies
//!
//! # Quick Start
//!
//! ```ignore
//! use marlin::prelude::*;
//!
//! let config = ConnectConfig::new()
//!     .endpoint(Endpoint::new("db1", 3306))
//!     .endpoint(Endpoint::new("db2", 3306).role(Role::Reader))
//!     .ha_mode(HaMode::Replication)
//!     .session(SessionConfig::new().user("app").password("secret"));
//!
//! let source = DataSource::new(config)?;
//! let mut conn = source.get_connection()?;
//!
//! // Read-only statements go to a reader.
//! let stmt = conn.prepare_read_only("SELECT name FROM heroes WHERE age > ?")?;
//! for row in conn.execute(&stmt, &[Value::Int(18)])? {
//!     println!("{:?}", row?.get_by_name("name"));
//! }
//!
//! // Everything else goes to the writer.
//! conn.begin()?;
//! conn.query_buffered("UPDATE heroes SET age = age + 1")?;
//! conn.commit()?;
//! conn.close()?;
//! ```

pub mod aurora;
pub mod connection;
pub mod ha;
pub mod listener;
pub mod routing;
pub mod statement;

pub use connection::{Connection, ConnectConfig, DEFAULT_BLACKLIST_BACKOFF_MS, DataSource};
pub use ha::HaMode;
pub use listener::Route;
pub use statement::Statement;

pub use marlin_core::{Endpoint, Error, Result, Role, Row, Value};
pub use marlin_mariadb::{QueryResult, ResultStream, SessionConfig};
pub use marlin_pool::{PoolConfig, PoolStats};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        ConnectConfig, Connection, DataSource, Endpoint, Error, HaMode, PoolConfig, QueryResult,
        Result, Role, Row, SessionConfig, Statement, Value,
    };
}
