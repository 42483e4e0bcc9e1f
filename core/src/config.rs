use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_USER_LIMIT: usize = 30;
pub const DEFAULT_PATH: &str = "bin:.";
const DEFAULT_SPAWN_RETRIES: u32 = 5;
const DEFAULT_SPAWN_RETRY_DELAY_MS: u64 = 5;
const DEFAULT_MAILBOX_STALL_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_MAX_LINE_BYTES: usize = 15_000;
const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Tunables for one server instance. Every field has a default, so an empty
/// TOML document is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Maximum number of concurrently active sessions.
    pub user_limit: usize,
    /// Initial `PATH` of every session environment.
    pub default_path: String,
    /// Working directory for stage processes; the server's cwd when unset.
    pub working_dir: Option<PathBuf>,
    /// Attempts made for a pipe or process creation before giving up.
    pub spawn_retries: u32,
    pub spawn_retry_delay_ms: u64,
    /// How long a publisher waits for an Active message to drain before
    /// resetting the mailbox.
    pub mailbox_stall_timeout_ms: u64,
    /// Input lines longer than this are truncated.
    pub max_line_bytes: usize,
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            user_limit: DEFAULT_USER_LIMIT,
            default_path: DEFAULT_PATH.to_string(),
            working_dir: None,
            spawn_retries: DEFAULT_SPAWN_RETRIES,
            spawn_retry_delay_ms: DEFAULT_SPAWN_RETRY_DELAY_MS,
            mailbox_stall_timeout_ms: DEFAULT_MAILBOX_STALL_TIMEOUT_MS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load a configuration file. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_limit == 0 {
            return Err(ConfigError::Invalid(
                "user_limit must be at least 1".to_string(),
            ));
        }
        if self.spawn_retries == 0 {
            return Err(ConfigError::Invalid(
                "spawn_retries must be at least 1".to_string(),
            ));
        }
        if self.outbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbox_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn spawn_retry_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_delay_ms)
    }

    pub fn mailbox_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.mailbox_stall_timeout_ms)
    }
}
