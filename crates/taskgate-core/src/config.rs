//! # Coordinator configuration.
//!
//! [`InterruptConfig`] is the file-level surface (TOML): which backend to use
//! and the TTLs state records are written with. [`CoordinatorConfig`] is the
//! runtime form the coordinator holds.
//!
//! # Example
//! ```
//! use taskgate_core::config::{BackendConfig, InterruptConfig};
//!
//! let cfg = InterruptConfig::from_toml_str(r#"
//!     running_ttl_secs = 120
//!     finished_ttl_secs = 30
//!
//!     [backend]
//!     kind = "redis"
//!     url = "redis://127.0.0.1:6379"
//! "#).unwrap();
//!
//! assert_eq!(cfg.backend, BackendConfig::Redis { url: "redis://127.0.0.1:6379".into() });
//! assert_eq!(cfg.coordinator_config().running_ttl.as_secs(), 120);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DEFAULT_CHANNEL_PREFIX;

/// Upper bound for either TTL (ten years). Keeps expiry timestamps and Redis
/// `EX` arguments in range.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("running_ttl must be greater than zero")]
    ZeroRunningTtl,

    #[error("finished_ttl must be greater than zero")]
    ZeroFinishedTtl,

    #[error("{field} ({ttl:?}) exceeds the maximum of {max_secs}s")]
    TtlTooLong {
        field: &'static str,
        ttl: Duration,
        max_secs: u64,
    },

    #[error("finished_ttl ({finished:?}) must be shorter than running_ttl ({running:?})")]
    FinishedTtlNotShorter { running: Duration, finished: Duration },

    #[error("channel_prefix must not be empty")]
    EmptyChannelPrefix,

    #[error("redis backend requires a non-empty url")]
    EmptyRedisUrl,
}

/// Which store/channel pair backs the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process store and channel; stop signals do not cross processes.
    #[default]
    Local,

    /// Shared Redis; every process pointed at `url` coordinates.
    Redis { url: String },
}

/// File-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    pub backend: BackendConfig,
    /// TTL of a record while its run is in flight (safety net for dead workers).
    pub running_ttl_secs: u64,
    /// TTL of the final state written after a run ends.
    pub finished_ttl_secs: u64,
    pub channel_prefix: String,
    /// How long `close()` waits for local runs to wind down.
    pub shutdown_grace_secs: u64,
}

impl Default for InterruptConfig {
    /// - `backend = local`
    /// - `running_ttl_secs = 3600`
    /// - `finished_ttl_secs = 600`
    /// - `channel_prefix = "chan:"`
    /// - `shutdown_grace_secs = 5`
    fn default() -> Self {
        Self {
            backend: BackendConfig::Local,
            running_ttl_secs: 3600,
            finished_ttl_secs: 600,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

impl InterruptConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let BackendConfig::Redis { url } = &self.backend {
            if url.trim().is_empty() {
                return Err(ConfigError::EmptyRedisUrl);
            }
        }
        self.coordinator_config().validate()
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            running_ttl: Duration::from_secs(self.running_ttl_secs),
            finished_ttl: Duration::from_secs(self.finished_ttl_secs),
            channel_prefix: self.channel_prefix.clone(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

/// Runtime settings held by an `InterruptCoordinator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub running_ttl: Duration,
    pub finished_ttl: Duration,
    pub channel_prefix: String,
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        InterruptConfig::default().coordinator_config()
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.running_ttl.is_zero() {
            return Err(ConfigError::ZeroRunningTtl);
        }
        if self.finished_ttl.is_zero() {
            return Err(ConfigError::ZeroFinishedTtl);
        }
        for (field, ttl) in [
            ("running_ttl", self.running_ttl),
            ("finished_ttl", self.finished_ttl),
        ] {
            if ttl > Duration::from_secs(MAX_TTL_SECS) {
                return Err(ConfigError::TtlTooLong {
                    field,
                    ttl,
                    max_secs: MAX_TTL_SECS,
                });
            }
        }
        if self.finished_ttl >= self.running_ttl {
            return Err(ConfigError::FinishedTtlNotShorter {
                running: self.running_ttl,
                finished: self.finished_ttl,
            });
        }
        if self.channel_prefix.is_empty() {
            return Err(ConfigError::EmptyChannelPrefix);
        }
        Ok(())
    }
}
