//! Configuration file parser for ~/.config/digest-notify/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as warnings, since they are
//! usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::{validate_feed_url, UrlValidationError};

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

    #[error("Invalid feed_url: {0}")]
    InvalidFeedUrl(#[from] UrlValidationError),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON Feed document to poll.
    pub feed_url: String,

    /// Minimum minutes between polls. 0 falls back to the default.
    pub check_interval_minutes: u64,

    /// Icon name or path passed to the notification server.
    pub icon: String,

    /// Feed request timeout in seconds. 0 falls back to the default.
    pub request_timeout_secs: u64,

    /// Application name shown by the notification server and the prompt.
    pub app_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: Self::DEFAULT_FEED_URL.to_string(),
            check_interval_minutes: Self::DEFAULT_CHECK_INTERVAL_MINUTES,
            icon: crate::controller::DEFAULT_ICON.to_string(),
            request_timeout_secs: Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            app_name: "Adobe Digest".to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    pub const DEFAULT_FEED_URL: &'static str = "https://adobedigest.com/feed.json";
    pub const DEFAULT_CHECK_INTERVAL_MINUTES: u64 = 6 * 60;
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

    const KNOWN_KEYS: [&'static str; 5] = [
        "feed_url",
        "check_interval_minutes",
        "icon",
        "request_timeout_secs",
        "app_name",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Non-http(s) `feed_url` → `Err(ConfigError::InvalidFeedUrl)`
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
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.feed_url()?;
        tracing::info!(path = %path.display(), feed = %config.feed_url, "Loaded configuration");
        Ok(config)
    }

    /// The validated feed URL.
    pub fn feed_url(&self) -> Result<Url, ConfigError> {
        Ok(validate_feed_url(&self.feed_url)?)
    }

    pub fn check_interval(&self) -> Duration {
        let minutes = match self.check_interval_minutes {
            0 => Self::DEFAULT_CHECK_INTERVAL_MINUTES,
            m => m,
        };
        Duration::from_secs(minutes.saturating_mul(60))
    }

    pub fn request_timeout(&self) -> Duration {
        let secs = match self.request_timeout_secs {
            0 => Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            s => s,
        };
        Duration::from_secs(secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
