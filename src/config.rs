//! Configuration file parser for ~/.config/tidings/config.toml.
//!
//! The config file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::sync::BackoffPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database location. Defaults to `tidings.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Scheduler, worker pool and download settings.
    pub sync: SyncConfig,
}

/// Settings for the backoff scheduler and the sync coordinator.
///
/// Wait periods are measured in scheduler ticks, one tick every
/// `tick_interval_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Floor for a feed's wait period. New feeds start here.
    pub min_wait_period: u32,
    /// Ceiling for a feed's wait period.
    pub max_wait_period: u32,
    /// Remaining wait applied after a failed fetch.
    pub retry_delay: u32,
    /// Worker pool size for concurrent fetches.
    pub max_concurrent_fetches: usize,
    pub tick_interval_secs: u64,
    /// Consecutive failures after which a feed is reported as persistently failing.
    pub failure_alert_threshold: u32,
    pub download_enclosures: bool,
    pub max_enclosure_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_wait_period: 1,
            max_wait_period: 64,
            retry_delay: 1,
            max_concurrent_fetches: 4,
            tick_interval_secs: 300,
            failure_alert_threshold: 5,
            download_enclosures: false,
            max_enclosure_bytes: 50 * 1024 * 1024,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Checks the relationships between settings.
    ///
    /// The retry delay may not exceed the minimum wait period, which keeps it
    /// shorter than any wait period a feed can reach.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_wait_period == 0 {
            return Err(ConfigError::Invalid(
                "sync.min_wait_period must be at least 1".into(),
            ));
        }
        if self.max_wait_period < self.min_wait_period {
            return Err(ConfigError::Invalid(format!(
                "sync.max_wait_period ({}) is below sync.min_wait_period ({})",
                self.max_wait_period, self.min_wait_period
            )));
        }
        if self.retry_delay > self.min_wait_period {
            return Err(ConfigError::Invalid(format!(
                "sync.retry_delay ({}) must not exceed sync.min_wait_period ({})",
                self.retry_delay, self.min_wait_period
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_concurrent_fetches must be at least 1".into(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.tick_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.min_wait_period, self.max_wait_period, self.retry_delay)
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 2] = ["database_path", "sync"];
    const KNOWN_SYNC_KEYS: [&'static str; 9] = [
        "min_wait_period",
        "max_wait_period",
        "retry_delay",
        "max_concurrent_fetches",
        "tick_interval_secs",
        "failure_alert_threshold",
        "download_enclosures",
        "max_enclosure_bytes",
        "request_timeout_secs",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Inconsistent values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.sync.validate()?;
        tracing::info!(
            min_wait = config.sync.min_wait_period,
            max_wait = config.sync.max_wait_period,
            workers = config.sync.max_concurrent_fetches,
            "Loaded configuration"
        );
        Ok(config)
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        if key == "sync" {
            if let Some(table) = value.as_table() {
                for sync_key in table.keys() {
                    if !Config::KNOWN_SYNC_KEYS.contains(&sync_key.as_str()) {
                        tracing::warn!(key = %format!("sync.{sync_key}"), "Unknown key in config file, ignoring");
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
