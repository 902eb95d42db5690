//! Session configuration: credentials and per-socket options.
//!
//! Endpoints are not part of this struct; the same configuration is used
//! for every server a logical connection talks to.

use crate::protocol::capabilities::{
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_FOUND_ROWS, DEFAULT_CLIENT_FLAGS,
};
use crate::protocol::charset;
use marlin_core::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Credentials and socket options for one physical session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Default database
    pub database: Option<String>,
    /// Character set or collation name (default: utf8mb4)
    pub charset: String,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Socket read timeout in milliseconds (0 = none)
    pub read_timeout_ms: u64,
    /// Report matched rather than changed rows for UPDATE
    pub found_rows: bool,
    /// Allow requesting the server RSA key for full authentication over a
    /// plaintext socket
    pub allow_public_key_retrieval: bool,
    /// Server RSA public key (PEM), used instead of requesting it
    pub server_public_key: Option<String>,
    /// Connection attributes sent with the handshake
    pub attributes: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            database: None,
            charset: "utf8mb4".to_string(),
            connect_timeout_ms: 30_000,
            read_timeout_ms: 0,
            found_rows: false,
            allow_public_key_retrieval: false,
            server_public_key: None,
            attributes: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("found_rows", &self.found_rows)
            .field("allow_public_key_retrieval", &self.allow_public_key_retrieval)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the default database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the character set by name.
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn read_timeout(mut self, ms: u64) -> Self {
        self.read_timeout_ms = ms;
        self
    }

    pub fn found_rows(mut self, enabled: bool) -> Self {
        self.found_rows = enabled;
        self
    }

    pub fn allow_public_key_retrieval(mut self, enabled: bool) -> Self {
        self.allow_public_key_retrieval = enabled;
        self
    }

    pub fn server_public_key(mut self, pem: impl Into<String>) -> Self {
        self.server_public_key = Some(pem.into());
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn password_str(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` means block indefinitely.
    pub fn read_timeout_duration(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// Collation id for the handshake response.
    pub fn charset_id(&self) -> Result<u8> {
        charset::from_name(&self.charset).ok_or_else(|| {
            Error::Config(ConfigError {
                message: format!("unsupported charset '{}'", self.charset),
            })
        })
    }

    /// Capabilities requested from the server.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.found_rows {
            flags |= CLIENT_FOUND_ROWS;
        }
        if !self.attributes.is_empty() {
            flags |= CLIENT_CONNECT_ATTRS;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::CLIENT_PROTOCOL_41;

    #[test]
    fn builder() {
        let config = SessionConfig::new()
            .user("app")
            .password("secret")
            .database("orders")
            .read_timeout(500)
            .attribute("program_name", "marlin-test");
        assert_eq!(config.user, "app");
        assert_eq!(config.password_str(), "secret");
        assert_eq!(config.read_timeout_duration(), Some(Duration::from_millis(500)));
        assert_eq!(config.attributes.get("program_name").map(String::as_str), Some("marlin-test"));
    }

    #[test]
    fn capability_flags_follow_options() {
        let plain = SessionConfig::new().capability_flags();
        assert!(plain & CLIENT_PROTOCOL_41 != 0);
        assert!(plain & CLIENT_CONNECT_WITH_DB == 0);
        assert!(plain & CLIENT_CONNECT_ATTRS == 0);

        let full = SessionConfig::new()
            .database("db")
            .found_rows(true)
            .attribute("k", "v")
            .capability_flags();
        assert!(full & CLIENT_CONNECT_WITH_DB != 0);
        assert!(full & CLIENT_FOUND_ROWS != 0);
        assert!(full & CLIENT_CONNECT_ATTRS != 0);
    }

    #[test]
    fn charset_lookup() {
        assert!(SessionConfig::new().charset_id().is_ok());
        assert!(matches!(
            SessionConfig::new().charset("ebcdic").charset_id(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn debug_hides_password() {
        let shown = format!("{:?}", SessionConfig::new().password("hunter2"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"user": "ro", "read_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.user, "ro");
        assert_eq!(config.charset, "utf8mb4");
        assert_eq!(config.connect_timeout_ms, 30_000);
    }
}
