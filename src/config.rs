//! Configuration types for Loupe

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::{LoupeError, Result};

/// Store open options
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Initialize the store if it is absent
    #[serde(default)]
    pub create: bool,
    /// Apply and flush every write immediately instead of batching
    #[serde(default)]
    pub synchronous: bool,
    /// Reject all mutations at the API boundary
    #[serde(default)]
    pub readonly: bool,
}

impl OpenOptions {
    /// Options for a writable store, created if missing.
    #[must_use]
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::default()
        }
    }

    /// Options for reading an existing store or archive.
    #[must_use]
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Self::default()
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Aggregate size budget in bytes that triggers a sweep
    pub size_limit: u64,

    /// Byte threshold below which a blob is stored inline instead of as a file
    pub inline_limit: usize,

    /// Compress blob payloads before placement
    pub blob_compression_enabled: bool,

    /// Start a session automatically when a writable store is opened
    pub auto_start_session: bool,

    /// Fraction of records retained by a size-budget sweep.
    ///
    /// A sweep keeps the newest `floor(n * retain_ratio) + 1` records, so
    /// the most recent record always survives.
    pub retain_ratio: f64,

    /// Records older than this many seconds are removed on sweep
    pub max_age_secs: u64,

    /// Minimum seconds between automatic sweeps
    pub sweep_interval_secs: u64,

    /// Request/response bodies larger than this are not stored
    pub body_size_limit: usize,

    /// Time source; override for deterministic tests
    #[serde(skip)]
    pub clock: Clock,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            size_limit: 256 * 1_000_000,      // 256 MB
            inline_limit: 16 * 1024,          // 16 KB
            blob_compression_enabled: true,
            auto_start_session: true,
            retain_ratio: 0.5,
            max_age_secs: 14 * 86_400, // two weeks
            sweep_interval_secs: 3600,
            body_size_limit: 8 * 1024 * 1024, // 8 MB
            clock: Clock::system(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LoupeError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| LoupeError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.size_limit == 0 {
            return Err(LoupeError::Config("size_limit cannot be 0".to_string()));
        }

        if !(self.retain_ratio > 0.0 && self.retain_ratio < 1.0) {
            return Err(LoupeError::Config(format!(
                "retain_ratio must be in (0, 1): {}",
                self.retain_ratio
            )));
        }

        if self.body_size_limit == 0 {
            return Err(LoupeError::Config(
                "body_size_limit cannot be 0".to_string(),
            ));
        }

        if self.inline_limit > self.body_size_limit {
            return Err(LoupeError::Config(format!(
                "inline_limit ({}) cannot exceed body_size_limit ({})",
                self.inline_limit, self.body_size_limit
            )));
        }

        Ok(())
    }
}
