//! Error types for Marlin operations.

use std::fmt;

/// Every failure a Marlin call can report.
///
/// The listener only retries what [`Error::is_transient`] accepts.
#[derive(Debug)]
pub enum Error {
    /// Socket could not be opened, was lost, or the login was refused
    Connection(ConnectionError),
    /// ERR packet in answer to a statement; the session stays usable
    Query(QueryError),
    /// The server sent something the codec cannot accept
    Protocol(ProtocolError),
    Pool(PoolError),
    Config(ConfigError),
    /// Caller misuse: bad length, size mismatch, foreign or closed statement
    InvalidArgument(String),
    OutOfMemory {
        requested: usize,
    },
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub code: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Statement handle unknown to the server
    UnknownStatement,
    /// Deadlock detected
    Deadlock,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No session became available before the acquire timeout
    Exhausted,
    /// Pool has been shut down
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Is this an I/O-level failure that switching endpoints may cure?
    ///
    /// Only these errors are retried by the failover listener.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::DnsResolution
                    | ConnectionErrorKind::Refused
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Did the server reject our credentials?
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Connection(c) if c.kind == ConnectionErrorKind::Authentication)
    }

    /// Is this a pool exhaustion error?
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::Pool(p) if p.kind == PoolErrorKind::Exhausted)
    }

    /// Does this error leave the session unusable?
    ///
    /// Statement errors reported by the server do not; everything that
    /// happens below the statement level does.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
            Error::OutOfMemory { .. } => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the server error code if available.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "connection failed: {e}"),
            Error::Query(e) => write!(f, "statement failed: {e}"),
            Error::Protocol(e) => write!(f, "protocol violation: {e}"),
            Error::Pool(e) => write!(f, "pool: {e}"),
            Error::Config(e) => write!(f, "invalid configuration: {e}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::OutOfMemory { requested } => {
                write!(f, "cannot allocate {requested} elements")
            }
            Error::Io(e) => write!(f, "socket: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(ConnectionError {
                source: Some(inner),
                ..
            }) => Some(inner.as_ref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// `[1062] Duplicate entry '1' for key 'PRIMARY' (SQLSTATE 23000)`
impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.message)?;
        if let Some(state) = &self.sqlstate {
            write!(f, " (SQLSTATE {state})")?;
        }
        Ok(())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

macro_rules! error_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::$variant(err)
                }
            }
        )*
    };
}

error_from! {
    std::io::Error => Io,
    ConnectionError => Connection,
    QueryError => Query,
    ProtocolError => Protocol,
    PoolError => Pool,
    ConfigError => Config,
}

/// Result type alias for Marlin operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(kind: ConnectionErrorKind) -> Error {
        Error::Connection(ConnectionError {
            kind,
            message: "boom".to_string(),
            source: None,
        })
    }

    #[test]
    fn transient_classification() {
        assert!(connection(ConnectionErrorKind::Disconnected).is_transient());
        assert!(connection(ConnectionErrorKind::Refused).is_transient());
        assert!(connection(ConnectionErrorKind::Connect).is_transient());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_transient());

        assert!(!connection(ConnectionErrorKind::Authentication).is_transient());
        assert!(connection(ConnectionErrorKind::Authentication).is_authentication());
        assert!(
            !Error::Protocol(ProtocolError {
                message: "bad packet".to_string(),
                raw_data: None,
            })
            .is_transient()
        );
        assert!(!Error::InvalidArgument("x".to_string()).is_transient());
    }

    #[test]
    fn query_errors_keep_the_session() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO t VALUES (1)".to_string()),
            sqlstate: Some("23000".to_string()),
            code: Some(1062),
            message: "Duplicate entry".to_string(),
        });
        assert!(!err.is_fatal_to_session());
        assert!(!err.is_transient());
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(
            err.to_string(),
            "statement failed: [1062] Duplicate entry (SQLSTATE 23000)"
        );
        assert!(connection(ConnectionErrorKind::Disconnected).is_fatal_to_session());
    }

    #[test]
    fn pool_exhausted_flag() {
        let err = Error::Pool(PoolError {
            kind: PoolErrorKind::Exhausted,
            message: "pool exhausted".to_string(),
        });
        assert!(err.is_pool_exhausted());
        assert_eq!(err.to_string(), "pool: pool exhausted");
    }
}
