//! Configuration management for the Spruce session layer.
//!
//! TOML-based configuration merged from defaults, an optional file and
//! `SPRUCE_*` environment variables, then validated.

use crate::crypto::SignatureAlgorithm;
use crate::session::CipherSuite;
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "spruce.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "SPRUCE";

/// Complete configuration for the session layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpruceConfig {
    /// Session lifetime and handshake acceptance
    #[serde(default)]
    pub session: SessionConfig,
    /// Algorithm selection
    #[serde(default)]
    pub crypto: CryptoConfig,
    /// Failed-message retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Background polling
    #[serde(default)]
    pub polling: PollingConfig,
    /// Persistence location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds after handshake completion before the session key is cleared
    pub idle_timeout_secs: u64,
    /// Oldest acceptable handshake timestamp, in seconds
    pub handshake_max_age_secs: u64,
    /// Re-arm the idle timer on every successful send/receive
    pub refresh_on_activity: bool,
}

/// Algorithm selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// AEAD used for application messages
    pub cipher_suite: CipherSuite,
    /// Signature scheme used to authenticate handshakes
    pub signature: SignatureAlgorithm,
    /// Remember nonces issued under the current key and refuse repeats
    pub track_nonces: bool,
}

/// Retry queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Entries at or above this retry count are not offered for retry
    pub max_retries: u32,
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between poll cycles, in milliseconds
    pub interval_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding persisted records
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: crate::defaults::DEFAULT_IDLE_TIMEOUT_SECS,
            handshake_max_age_secs: crate::defaults::DEFAULT_HANDSHAKE_MAX_AGE_SECS,
            refresh_on_activity: false,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            cipher_suite: CipherSuite::Aes256Gcm,
            signature: SignatureAlgorithm::MlDsa65,
            track_nonces: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::defaults::DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::defaults::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("spruce"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a [`Duration`]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl PollingConfig {
    /// Poll interval as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SpruceConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("spruce")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|p| p.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(secs) = std::env::var("SPRUCE_SESSION_IDLE_TIMEOUT_SECS") {
            self.session.idle_timeout_secs =
                secs.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "SPRUCE_SESSION_IDLE_TIMEOUT_SECS".to_string(),
                    value: secs,
                })?;
        }

        if let Ok(ms) = std::env::var("SPRUCE_POLLING_INTERVAL_MS") {
            self.polling.interval_ms = ms.parse().map_err(|_| ConfigError::InvalidValue {
                field: "SPRUCE_POLLING_INTERVAL_MS".to_string(),
                value: ms,
            })?;
        }

        if let Ok(level) = std::env::var("SPRUCE_LOGGING_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var("SPRUCE_STORAGE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, value: String| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
        };

        if self.session.idle_timeout_secs == 0 {
            return Err(invalid("session.idle_timeout_secs", "0".to_string()).into());
        }

        if self.polling.interval_ms == 0 {
            return Err(invalid("polling.interval_ms", "0".to_string()).into());
        }

        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "0".to_string()).into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", self.logging.level.clone()).into()),
        }

        Ok(())
    }

    /// Ensure the data directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        let dir = &self.storage.data_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                path: dir.display().to_string(),
            })?;
        }
        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
