//! Server configuration, loadable from an optional TOML file.
//!
//! Every key is optional; anything missing takes the value from
//! `ServerConfig::default()`.
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/trellis"
//! default_lock_minutes = 5
//!
//! [[tokens]]
//! token = "alice-secret"
//! user_id = "6f1c0f0e-3a0b-4d7e-9a55-1d3b1e1f2a10"
//! display_name = "Alice"
//! email = "alice@example.com"
//! ```

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::model::UserIdentity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// A bearer token accepted by the built-in identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub email: String,
}

impl TokenEntry {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.user_id, self.display_name.clone(), self.email.clone())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Lease length when `acquire_lock` names no duration
    pub default_lock_minutes: i64,
    /// Upper bound on a requested lease
    pub max_lock_minutes: i64,
    /// Expired-lock sweep period
    pub lock_sweep_interval_secs: u64,
    /// How long a session may sit with no active participants before it ends
    pub empty_session_grace_secs: u64,
    /// Change-log tail sent in `session_state`
    pub recent_events_limit: usize,
    /// Undo eligibility window
    pub undo_window_secs: i64,
    /// env_logger filter used when RUST_LOG is unset
    pub log_level: String,
    /// Static bearer tokens
    pub tokens: Vec<TokenEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            default_lock_minutes: 5,
            max_lock_minutes: 60,
            lock_sweep_interval_secs: 30,
            empty_session_grace_secs: 120,
            recent_events_limit: 100,
            undo_window_secs: 3600,
            log_level: "info".to_string(),
            tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Clamp a requested lease to `[1, max_lock_minutes]`, falling back to the default.
    pub fn lease(&self, requested_minutes: Option<i64>) -> Duration {
        let max = self.max_lock_minutes.max(1);
        let minutes = requested_minutes
            .unwrap_or(self.default_lock_minutes)
            .clamp(1, max);
        Duration::minutes(minutes)
    }

    pub fn undo_window(&self) -> Duration {
        Duration::seconds(self.undo_window_secs)
    }

    pub fn empty_session_grace(&self) -> Duration {
        Duration::seconds(self.empty_session_grace_secs as i64)
    }
}
