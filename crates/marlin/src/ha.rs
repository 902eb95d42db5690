//! High-availability modes.
//!
//! Names and per-mode traits come from one immutable table; every lookup is
//! a pure function over it.

use marlin_core::{ConfigError, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failover and routing policy of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum HaMode {
    /// One fixed endpoint; any I/O failure is fatal.
    #[default]
    None,
    /// Replication with the writer discovered from the cluster topology.
    Aurora,
    /// Writes to the writer, read-only statements to readers.
    Replication,
    /// First reachable endpoint in order, sticky until it fails.
    Sequential,
    /// Statements spread across all healthy endpoints.
    LoadBalance,
}

struct ModeInfo {
    mode: HaMode,
    name: &'static str,
    failover: bool,
    splits_reads: bool,
}

static MODES: [ModeInfo; 5] = [
    ModeInfo {
        mode: HaMode::None,
        name: "none",
        failover: false,
        splits_reads: false,
    },
    ModeInfo {
        mode: HaMode::Aurora,
        name: "aurora",
        failover: true,
        splits_reads: true,
    },
    ModeInfo {
        mode: HaMode::Replication,
        name: "replication",
        failover: true,
        splits_reads: true,
    },
    ModeInfo {
        mode: HaMode::Sequential,
        name: "sequential",
        failover: true,
        splits_reads: false,
    },
    ModeInfo {
        mode: HaMode::LoadBalance,
        name: "loadbalance",
        failover: true,
        splits_reads: false,
    },
];

impl HaMode {
    /// All modes, in table order.
    pub const ALL: [HaMode; 5] = [
        HaMode::None,
        HaMode::Aurora,
        HaMode::Replication,
        HaMode::Sequential,
        HaMode::LoadBalance,
    ];

    fn info(self) -> &'static ModeInfo {
        &MODES[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.info().name
    }

    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Self> {
        MODES
            .iter()
            .find(|info| info.name.eq_ignore_ascii_case(name))
            .map(|info| info.mode)
    }

    /// Whether transient failures are retried on another endpoint.
    pub fn allows_failover(self) -> bool {
        self.info().failover
    }

    /// Whether read-only statements go to reader endpoints.
    pub fn splits_reads(self) -> bool {
        self.info().splits_reads
    }
}

impl fmt::Display for HaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HaMode::from_name(s).ok_or_else(|| {
            Error::Config(ConfigError {
                message: format!("unknown HA mode '{s}'"),
            })
        })
    }
}

impl TryFrom<String> for HaMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HaMode> for &'static str {
    fn from(mode: HaMode) -> Self {
        mode.as_str()
    }
}
