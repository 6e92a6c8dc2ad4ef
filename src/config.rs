//! Runtime configuration, loadable from TOML.
//!
//! ```toml
//! room = "paychan"
//! default_expiry_secs = 60
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::U256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pub/sub room both parties join.
    pub room: String,
    /// Expiry used by `create_channel` when the caller gives none.
    pub default_expiry_secs: u64,
    /// Pending commands before `SessionHandle` calls start waiting.
    pub mailbox_capacity: usize,
    /// Notices buffered per subscriber; slow subscribers lose the oldest.
    pub notice_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room: "paychan".to_string(),
            default_expiry_secs: 60,
            mailbox_capacity: 64,
            notice_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.is_empty() {
            return Err(ConfigError::Invalid("room must not be empty"));
        }
        // Both are channel capacities, tokio panics on zero.
        if self.mailbox_capacity == 0 || self.notice_capacity == 0 {
            return Err(ConfigError::Invalid("capacities must be positive"));
        }
        Ok(())
    }
}

/// Behaviour of [crate::ledger::SimulatedLedger].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedLedgerConfig {
    /// Flat fee charged to the caller of every successful state-changing
    /// call.
    pub fee: U256,
    /// Artificial confirmation latency per call.
    pub latency_ms: u64,
    /// Initial ledger clock (seconds).
    pub start_time: u64,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            fee: U256::zero(),
            latency_ms: 0,
            start_time: 1_700_000_000,
        }
    }
}

impl SimulatedLedgerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}
