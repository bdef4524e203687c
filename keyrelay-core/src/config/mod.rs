//! Configuration for the decryption engine
//!
//! Defaults match the protocol's pacing constants. Values can be
//! overridden from `KEYRELAY_*` environment variables or a TOML file.

use crate::logging::{LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Pacing delay between ticks when no new group sessions are queued
pub const DEFAULT_TICK_DELAY: Duration = Duration::from_millis(15);
/// Delay before a failed decryption is retried
pub const DEFAULT_DECRYPTION_RETRY_DELAY: Duration = Duration::from_millis(3000);
/// Delay before a stream with missing keys solicits them
pub const DEFAULT_MISSING_KEYS_DELAY: Duration = Duration::from_millis(1000);
/// Upper bound on session ids requested by one key solicitation
pub const DEFAULT_MAX_MISSING_SESSION_IDS: usize = 100;

/// Decryption engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptionConfig {
    /// Delay before the next tick when nothing urgent is queued
    #[serde(with = "humantime_serde")]
    pub tick_delay: Duration,

    /// Delay before a failed decryption is attempted again
    #[serde(with = "humantime_serde")]
    pub decryption_retry_delay: Duration,

    /// Delay before missing keys are requested for a stream
    #[serde(with = "humantime_serde")]
    pub missing_keys_delay: Duration,

    /// Maximum number of session ids in one key solicitation
    pub max_missing_session_ids: usize,

    /// Buffer size of the status notification channel
    pub status_channel_capacity: usize,

    /// Minimum interval between queue-size log lines
    #[serde(with = "humantime_serde")]
    pub queue_report_interval: Duration,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            tick_delay: DEFAULT_TICK_DELAY,
            decryption_retry_delay: DEFAULT_DECRYPTION_RETRY_DELAY,
            missing_keys_delay: DEFAULT_MISSING_KEYS_DELAY,
            max_missing_session_ids: DEFAULT_MAX_MISSING_SESSION_IDS,
            status_channel_capacity: 100,
            queue_report_interval: Duration::from_secs(1),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Convert into subscriber options
    pub fn to_log_config(&self) -> Result<LogConfig, ConfigError> {
        let level = LogLevel::from_str(&self.level)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        Ok(LogConfig::new(level)
            .with_timestamp(self.with_timestamp)
            .with_target(self.with_target)
            .json_format(self.json_format))
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl DecryptionConfig {
    /// Load configuration from environment variables
    ///
    /// Recognised variables: `KEYRELAY_TICK_DELAY_MS`, `KEYRELAY_RETRY_DELAY_MS`,
    /// `KEYRELAY_MISSING_KEYS_DELAY_MS`, `KEYRELAY_MAX_MISSING_SESSION_IDS`,
    /// `KEYRELAY_LOG_LEVEL`, `KEYRELAY_LOG_JSON`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(delay) = env_millis("KEYRELAY_TICK_DELAY_MS")? {
            config.tick_delay = delay;
        }
        if let Some(delay) = env_millis("KEYRELAY_RETRY_DELAY_MS")? {
            config.decryption_retry_delay = delay;
        }
        if let Some(delay) = env_millis("KEYRELAY_MISSING_KEYS_DELAY_MS")? {
            config.missing_keys_delay = delay;
        }
        if let Ok(max) = env::var("KEYRELAY_MAX_MISSING_SESSION_IDS") {
            config.max_missing_session_ids = max.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid max missing session ids: {}", e))
            })?;
        }

        if let Ok(level) = env::var("KEYRELAY_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("KEYRELAY_LOG_JSON") {
            config.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_missing_session_ids == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_missing_session_ids must be greater than 0".to_string(),
            ));
        }

        if self.status_channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "status_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if LogLevel::from_str(&self.logging.level).is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| ConfigError::io(path, e))?;

        Ok(())
    }
}
