//! Server endpoints.

use crate::error::{ConfigError, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default MariaDB port.
pub const DEFAULT_PORT: u16 = 3306;

/// Role an endpoint plays in a replicated topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts writes.
    #[default]
    #[serde(alias = "master")]
    Writer,
    /// Read-only replica.
    #[serde(alias = "slave")]
    Reader,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Writer => "writer",
            Role::Reader => "reader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "writer" | "master" => Ok(Role::Writer),
            "reader" | "slave" => Ok(Role::Reader),
            other => Err(Error::Config(ConfigError {
                message: format!("unknown endpoint role '{other}'"),
            })),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_weight() -> u32 {
    1
}

/// One server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub role: Role,
    /// Relative share of load-balanced traffic.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Endpoint {
    /// A writer endpoint with weight 1.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            role: Role::Writer,
            weight: 1,
        }
    }

    /// Set the role.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the load-balancing weight.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn is_writer(&self) -> bool {
        self.role == Role::Writer
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.role)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config(ConfigError {
                message: "empty endpoint".to_string(),
            }));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| {
                    Error::Config(ConfigError {
                        message: format!("invalid port in endpoint '{s}'"),
                    })
                })?;
                Ok(Endpoint::new(host, port))
            }
            Some(_) => Err(Error::Config(ConfigError {
                message: format!("missing host in endpoint '{s}'"),
            })),
            None => Ok(Endpoint::new(s, DEFAULT_PORT)),
        }
    }
}
