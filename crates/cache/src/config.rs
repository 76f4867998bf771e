//! Cache configuration for retention bounds, working-set size and prefetch.
//!
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically with the `with_*` builders.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retention policy for entries nobody references
///
/// When enabled, up to `max_entries` unreferenced entries are kept alive so a
/// quick re-acquire is free; beyond that the oldest are evicted. When
/// disabled (or `max_entries` is 0) entries are finalized as soon as their
/// last holder releases them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Keep unreferenced entries instead of revoking them immediately
    pub retain: bool,
    /// Maximum number of unreferenced entries kept alive
    pub max_entries: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self::bounded(32)
    }
}

impl RetentionConfig {
    /// Finalize entries on last release
    pub fn disabled() -> Self {
        Self {
            retain: false,
            max_entries: 0,
        }
    }

    /// Retain up to `max_entries` unreferenced entries
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            retain: true,
            max_entries,
        }
    }

    /// Returns true if unreferenced entries are kept at all
    pub fn is_enabled(&self) -> bool {
        self.retain && self.max_entries > 0
    }

    /// Number of unreferenced entries allowed to stay alive
    pub fn limit(&self) -> usize {
        if self.is_enabled() {
            self.max_entries
        } else {
            0
        }
    }
}

/// Configuration for the reader's caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of loaded spine sections; `None` is unbounded
    pub max_loaded_sections: Option<usize>,
    /// How many neighbours on each side to prefetch
    pub prefetch_distance: usize,
    /// Scale factor of the low-resolution placeholder shown while zooming
    pub preview_scale: f32,
    /// Retention for generic resources (chapters, images, fonts)
    pub resources: RetentionConfig,
    /// Retention for rendered PDF pages
    pub pages: RetentionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_loaded_sections: None,
            prefetch_distance: 2,
            preview_scale: 0.25,
            resources: RetentionConfig::bounded(32),
            pages: RetentionConfig::bounded(12),
        }
    }
}

impl CacheConfig {
    /// Sets the generic resource retention.
    pub fn with_resources(mut self, retention: RetentionConfig) -> Self {
        self.resources = retention;
        self
    }

    /// Sets the rendered page retention.
    pub fn with_pages(mut self, retention: RetentionConfig) -> Self {
        self.pages = retention;
        self
    }

    /// Sets the spine working-set cap.
    pub fn with_max_loaded_sections(mut self, max: Option<usize>) -> Self {
        self.max_loaded_sections = max;
        self
    }

    /// Sets the prefetch distance.
    pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
        self.prefetch_distance = distance;
        self
    }

    /// Sets the placeholder scale factor.
    pub fn with_preview_scale(mut self, scale: f32) -> Self {
        self.preview_scale = scale;
        self
    }

    /// Returns the default configuration file location.
    ///
    /// - macOS: ~/Library/Application Support/reader-engine/cache.toml
    /// - Linux: ~/.config/reader-engine/cache.toml
    /// - Windows: %APPDATA%\reader-engine\cache.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("reader-engine").join("cache.toml")
        } else {
            PathBuf::from("reader-engine/cache.toml")
        }
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.preview_scale.is_finite() || self.preview_scale <= 0.0 || self.preview_scale > 1.0
        {
            return Err(ConfigError::InvalidValue("preview_scale".to_string()));
        }
        if self.max_loaded_sections == Some(0) {
            return Err(ConfigError::InvalidValue("max_loaded_sections".to_string()));
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `READER_RETAIN_RESOURCES`: keep unreferenced resources (default: true)
    /// - `READER_MAX_RESOURCES`: unreferenced resources kept (default: 32)
    /// - `READER_RETAIN_PAGES`: keep unreferenced pages (default: true)
    /// - `READER_MAX_PAGES`: unreferenced pages kept (default: 12)
    /// - `READER_MAX_LOADED_SECTIONS`: spine working-set cap (default: unbounded)
    /// - `READER_PREFETCH_DISTANCE`: neighbours per side (default: 2)
    /// - `READER_PREVIEW_SCALE`: placeholder scale (default: 0.25)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(retain) = env_value("READER_RETAIN_RESOURCES")? {
            config.resources.retain = retain;
        }
        if let Some(max) = env_value("READER_MAX_RESOURCES")? {
            config.resources.max_entries = max;
        }
        if let Some(retain) = env_value("READER_RETAIN_PAGES")? {
            config.pages.retain = retain;
        }
        if let Some(max) = env_value("READER_MAX_PAGES")? {
            config.pages.max_entries = max;
        }
        if let Some(max) = env_value("READER_MAX_LOADED_SECTIONS")? {
            config.max_loaded_sections = Some(max);
        }
        if let Some(distance) = env_value("READER_PREFETCH_DISTANCE")? {
            config.prefetch_distance = distance;
        }
        if let Some(scale) = env_value("READER_PREVIEW_SCALE")? {
            config.preview_scale = scale;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// max_loaded_sections = 5
    /// prefetch_distance = 2
    /// preview_scale = 0.25
    ///
    /// [resources]
    /// retain = true
    /// max_entries = 32
    ///
    /// [pages]
    /// retain = true
    /// max_entries = 12
    /// ```
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed TOML
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Configuration could not be serialized
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
