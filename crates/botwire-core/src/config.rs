//! Session configuration.

use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum of consecutive reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default minimum delay between two sends (milliseconds).
pub const DEFAULT_SEND_DELAY_MS: u64 = 500;
/// Default wait timeout (milliseconds).
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options recognised by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Credential location, only read by the connector.
    pub auth_dir: PathBuf,
    /// Log filter directive for the binary's subscriber.
    pub log_level: String,
    /// Consecutive recoverable closes tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Maximum number of queued outbound messages.
    pub queue_capacity: usize,
    /// Minimum delay between two sends, in milliseconds.
    pub send_delay_ms: u64,
    /// Drop inbound messages sent by this account before correlation.
    pub ignore_self_messages: bool,
    /// Timeout applied by `WaitOptions` built from this config.
    pub default_wait_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_dir: default_auth_dir(),
            log_level: "info".to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_delay_ms: DEFAULT_SEND_DELAY_MS,
            ignore_self_messages: true,
            default_wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

fn default_auth_dir() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from(".botwire").join("auth"),
        |dir| dir.join("botwire").join("auth"),
    )
}

impl SessionConfig {
    /// Parse a JSON document; missing keys take their defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or the values are invalid.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), "Loaded session config");
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns error if the queue capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }

    /// Minimum delay between two sends.
    #[must_use]
    pub const fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    /// Timeout for waits that don't set their own.
    #[must_use]
    pub const fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }

    /// Set the credential location.
    #[must_use]
    pub fn with_auth_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.auth_dir = dir.into();
        self
    }

    /// Set the log filter.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the reconnect bound.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the minimum delay between sends.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Choose whether self-originated messages are ignored by waits.
    #[must_use]
    pub fn with_ignore_self_messages(mut self, ignore: bool) -> Self {
        self.ignore_self_messages = ignore;
        self
    }

    /// Set the default wait timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_reconnect_attempts, DEFAULT_MAX_RECONNECT_ATTEMPTS);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.send_delay(), Duration::from_millis(500));
        assert!(config.ignore_self_messages);
        assert!(config.auth_dir.ends_with("auth"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SessionConfig::from_json_str(r#"{"queue_capacity": 3, "send_delay_ms": 0}"#).unwrap();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.send_delay(), Duration::ZERO);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = SessionConfig::from_json_str(r#"{"queue_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroCapacity));
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_send_delay(Duration::from_millis(250))
            .with_max_reconnect_attempts(2)
            .with_ignore_self_messages(false);
        assert_eq!(config.send_delay_ms, 250);
        assert_eq!(config.max_reconnect_attempts, 2);
        assert!(!config.ignore_self_messages);
    }
}
