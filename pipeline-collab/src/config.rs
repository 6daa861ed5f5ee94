//! Server configuration.
//!
//! Deployment settings come from the environment, read once at startup:
//!
//! | Variable              | Meaning                         | Default  |
//! |-----------------------|---------------------------------|----------|
//! | `COLLAB_PORT`         | TCP port to listen on           | `4455`   |
//! | `COLLAB_PERSISTENCE`  | `memory` or `durable`           | `memory` |
//! | `COLLAB_STORAGE_PATH` | RocksDB directory (durable)     | required |
//!
//! Timing knobs are plain fields with defaults; embedding code and tests
//! override them with the `with_*` builders.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::storage::PersistenceMode;

pub const DEFAULT_PORT: u16 = 4455;

pub const ENV_PORT: &str = "COLLAB_PORT";
pub const ENV_PERSISTENCE: &str = "COLLAB_PERSISTENCE";
pub const ENV_STORAGE_PATH: &str = "COLLAB_STORAGE_PATH";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("COLLAB_PORT must be a port number between 1 and 65535, got {0:?}")]
    InvalidPort(String),
    #[error("COLLAB_PERSISTENCE must be \"memory\" or \"durable\", got {0:?}")]
    InvalidPersistenceMode(String),
    #[error("COLLAB_STORAGE_PATH is required when COLLAB_PERSISTENCE=durable")]
    MissingStoragePath,
}

/// Configuration for the collaboration server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub persistence: PersistenceMode,
    /// Frames buffered per connection before it is considered lagged
    pub broadcast_capacity: usize,
    /// How long an empty room stays in memory waiting for a reconnect
    pub grace_period: Duration,
    /// Delay between the first unsaved change and its flush
    pub flush_debounce: Duration,
    /// Connections silent for this long are closed
    pub idle_timeout: Duration,
    /// Presence entries not refreshed for this long are removed
    pub presence_ttl: Duration,
    pub presence_sweep_interval: Duration,
    pub stats_interval: Duration,
    /// Upper bound on the final flush during shutdown
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            persistence: PersistenceMode::Memory,
            broadcast_capacity: 256,
            grace_period: Duration::from_secs(30),
            flush_debounce: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(120),
            presence_ttl: Duration::from_secs(30),
            presence_sweep_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Read the deployment settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup(ENV_PORT) {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(ConfigError::InvalidPort(raw)),
            },
            None => DEFAULT_PORT,
        };

        let persistence = match lookup(ENV_PERSISTENCE).as_deref().map(str::trim) {
            None | Some("") | Some("memory") => PersistenceMode::Memory,
            Some("durable") => {
                let path = lookup(ENV_STORAGE_PATH)
                    .filter(|p| !p.trim().is_empty())
                    .ok_or(ConfigError::MissingStoragePath)?;
                PersistenceMode::Durable {
                    path: PathBuf::from(path),
                }
            }
            Some(other) => return Err(ConfigError::InvalidPersistenceMode(other.to_string())),
        };

        Ok(Self::new(format!("0.0.0.0:{port}")).with_persistence(persistence))
    }

    pub fn with_persistence(mut self, persistence: PersistenceMode) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_flush_debounce(mut self, debounce: Duration) -> Self {
        self.flush_debounce = debounce;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the presence TTL and sweeps at a third of it.
    pub fn with_presence_ttl(mut self, ttl: Duration) -> Self {
        self.presence_ttl = ttl;
        self.presence_sweep_interval = (ttl / 3).max(Duration::from_millis(1));
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(format!("0.0.0.0:{DEFAULT_PORT}"))
    }
}
