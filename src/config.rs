//! Node configuration
//!
//! Loaded from a JSON file. Only `location` and `toplevel_dir` are
//! required; every other field has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::retry::{RetryPolicy, RetryStrategy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "RK_CONFIG_READ",
            ConfigError::Parse(_) => "RK_CONFIG_PARSE",
            ConfigError::Invalid(_) => "RK_CONFIG_INVALID",
        }
    }

    /// A node cannot start without a usable configuration.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Backoff for peer deliveries during fragment replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_retry_strategy(),
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        let policy = match self.strategy {
            RetryStrategy::Linear => RetryPolicy::linear(self.max_attempts, base),
            RetryStrategy::Exponential => RetryPolicy::exponential(self.max_attempts, base),
        };
        policy
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

fn default_retry_strategy() -> RetryStrategy {
    RetryStrategy::Exponential
}
fn default_retry_attempts() -> usize {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    200
}
fn default_retry_max_delay_ms() -> u64 {
    5_000
}
fn default_retry_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identity, e.g. `rs1`
    pub location: String,

    /// Root of the shared filesystem; logs live under
    /// `<toplevel_dir>/servers/<location>/log`
    pub toplevel_dir: PathBuf,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: u64,

    /// Deadline for barrier waits on incoming requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Upper bound for one `replay_fragments` run when the caller gives none
    #[serde(default = "default_replay_timeout_ms")]
    pub replay_timeout_ms: u64,

    #[serde(default = "default_replay_status_interval_ms")]
    pub replay_status_interval_ms: u64,

    /// Skip the rest of a corrupt commit-log fragment instead of failing
    #[serde(default)]
    pub skip_corrupt_fragments: bool,

    /// Fragment size at which the commit log rolls
    #[serde(default = "default_commit_log_roll_limit")]
    pub commit_log_roll_limit: u64,

    #[serde(default = "default_flush_limit_per_range")]
    pub replay_flush_limit_per_range: u64,

    #[serde(default = "default_flush_limit_aggregate")]
    pub replay_flush_limit_aggregate: u64,

    /// Batches queued per destination before the scanner blocks
    #[serde(default = "default_channel_capacity")]
    pub replay_channel_capacity: usize,

    #[serde(default)]
    pub delivery_retry: RetryConfig,

    #[serde(default = "default_metalog_max_files")]
    pub metalog_max_files: usize,
}

fn default_cluster_id() -> u64 {
    1
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_replay_timeout_ms() -> u64 {
    600_000
}
fn default_replay_status_interval_ms() -> u64 {
    10_000
}
fn default_commit_log_roll_limit() -> u64 {
    100 * 1024 * 1024
}
fn default_flush_limit_per_range() -> u64 {
    10 * 1024 * 1024
}
fn default_flush_limit_aggregate() -> u64 {
    100 * 1024 * 1024
}
fn default_channel_capacity() -> usize {
    64
}
fn default_metalog_max_files() -> usize {
    10
}

impl NodeConfig {
    /// Configuration with every optional field at its default.
    pub fn new(location: impl Into<String>, toplevel_dir: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            toplevel_dir: toplevel_dir.into(),
            cluster_id: default_cluster_id(),
            request_timeout_ms: default_request_timeout_ms(),
            replay_timeout_ms: default_replay_timeout_ms(),
            replay_status_interval_ms: default_replay_status_interval_ms(),
            skip_corrupt_fragments: false,
            commit_log_roll_limit: default_commit_log_roll_limit(),
            replay_flush_limit_per_range: default_flush_limit_per_range(),
            replay_flush_limit_aggregate: default_flush_limit_aggregate(),
            replay_channel_capacity: default_channel_capacity(),
            delivery_retry: RetryConfig::default(),
            metalog_max_files: default_metalog_max_files(),
        }
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.location.is_empty() || self.location.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "location must be a non-empty name without '/': {:?}",
                self.location
            )));
        }
        if self.toplevel_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("toplevel_dir must be set".into()));
        }
        if self.request_timeout_ms == 0 || self.replay_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        if self.replay_status_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "replay_status_interval_ms must be > 0".into(),
            ));
        }
        if self.commit_log_roll_limit == 0 {
            return Err(ConfigError::Invalid("commit_log_roll_limit must be > 0".into()));
        }
        if self.replay_flush_limit_per_range == 0
            || self.replay_flush_limit_aggregate < self.replay_flush_limit_per_range
        {
            return Err(ConfigError::Invalid(
                "replay flush limits must be > 0 and aggregate >= per-range".into(),
            ));
        }
        if self.replay_channel_capacity == 0 {
            return Err(ConfigError::Invalid("replay_channel_capacity must be > 0".into()));
        }
        if self.delivery_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "delivery_retry.max_attempts must be > 0".into(),
            ));
        }
        if self.metalog_max_files == 0 {
            return Err(ConfigError::Invalid("metalog_max_files must be > 0".into()));
        }
        Ok(())
    }

    /// Log directory of `location`.
    pub fn server_log_dir(&self, location: &str) -> PathBuf {
        self.toplevel_dir.join("servers").join(location).join("log")
    }

    /// This node's log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.server_log_dir(&self.location)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }

    pub fn replay_status_interval(&self) -> Duration {
        Duration::from_millis(self.replay_status_interval_ms)
    }
}
