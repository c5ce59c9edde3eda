//! Configuration file parser for the ingestion daemon.
//!
//! The config file is optional. A missing file yields `Config::default()`,
//! and any subset of keys may be specified. Unknown keys are accepted by
//! serde but logged as a warning to catch typos.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::ingest::DEFAULT_ALLOWED_TAGS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between ingestion ticks.
    pub tick_interval_secs: u64,

    /// How many feeds are processed concurrently within a tick.
    pub concurrency: usize,

    /// Per-request timeout in seconds, covering both feed and page fetches.
    pub request_timeout_secs: u64,

    /// Retries after the first failed attempt (3 means up to 4 requests).
    pub retry_attempts: u32,

    /// Base delay for exponential backoff between retries.
    pub retry_base_delay_ms: u64,

    /// HTML elements allowed to survive sanitization.
    pub allowed_tags: Vec<String>,

    /// SQLite database file path.
    pub database_path: String,

    /// User-Agent header sent with every request.
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_secs: 3600,
            concurrency: 10,
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 2000,
            allowed_tags: DEFAULT_ALLOWED_TAGS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            database_path: "weir.db".to_string(),
            user_agent: concat!("weir/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion from a
        // maliciously large or corrupted config file.
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
                // Race: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse as a raw table first to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "tick_interval_secs",
                "concurrency",
                "request_timeout_secs",
                "retry_attempts",
                "retry_base_delay_ms",
                "allowed_tags",
                "database_path",
                "user_agent",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            tick_interval_secs = config.tick_interval_secs,
            concurrency = config.concurrency,
            database = %config.database_path,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Reject values that would make the daemon spin, hang, or sleep for
    /// unbounded stretches.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        // 2^10 on the base delay is already over half an hour at the default
        if self.retry_attempts > 10 {
            return Err(ConfigError::Invalid(
                "retry_attempts must be at most 10".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
