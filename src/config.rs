// this_file: src/config.rs
//! Allocator and pool configuration.
//!
//! Configuration is plain JSON, read once at startup. Every field has a
//! default, so `{}` is a valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default size of a chunk requested from the provider (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Granularity of provider regions
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of idle bitmaps kept by the pool
pub const DEFAULT_MAX_IDLE_ENTRIES: usize = 16;

/// Default byte budget for idle bitmaps (64 MiB)
pub const DEFAULT_MAX_IDLE_BYTES: usize = 64 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Block allocator settings
    pub allocator: AllocatorConfig,
    /// Buffer pool settings
    pub pool: PoolConfig,
    /// Memory provider settings
    pub provider: ProviderConfig,
}

/// Block allocator settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Minimum size of a new chunk in bytes
    pub default_chunk_size: usize,
    /// Chunk sizes are rounded up to a multiple of this (power of two)
    pub page_size: usize,
    /// Panic on bookkeeping inconsistencies instead of returning an error
    pub panic_on_invariant_violation: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            panic_on_invariant_violation: cfg!(debug_assertions),
        }
    }
}

/// Buffer pool idle limits. Zero for either limit disables caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of Free entries retained
    pub max_idle_entries: usize,
    /// Maximum aggregate byte size of Free entries
    pub max_idle_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_entries: DEFAULT_MAX_IDLE_ENTRIES,
            max_idle_bytes: DEFAULT_MAX_IDLE_BYTES,
        }
    }
}

/// Memory provider settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Upper bound on bytes held in regions at once; `None` is unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<usize>,
}

impl Config {
    /// Parse and validate a configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::InvalidRequest(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.allocator.validate()?;
        if let Some(limit) = self.provider.limit_bytes {
            if limit < self.allocator.page_size {
                return Err(Error::InvalidRequest(format!(
                    "provider limit {} is smaller than one page ({})",
                    limit, self.allocator.page_size
                )));
            }
        }
        Ok(())
    }
}

impl AllocatorConfig {
    /// Check page size and chunk size
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(Error::InvalidRequest(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.default_chunk_size < self.page_size {
            return Err(Error::InvalidRequest(format!(
                "default_chunk_size {} is smaller than page_size {}",
                self.default_chunk_size, self.page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.allocator.default_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.pool.max_idle_entries, DEFAULT_MAX_IDLE_ENTRIES);
        assert!(config.provider.limit_bytes.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let json = r#"{"pool": {"max_idle_entries": 4}, "provider": {"limit_bytes": 1048576}}"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.pool.max_idle_entries, 4);
        assert_eq!(config.pool.max_idle_bytes, DEFAULT_MAX_IDLE_BYTES);
        assert_eq!(config.provider.limit_bytes, Some(1024 * 1024));
    }

    #[test]
    fn rejects_bad_page_size() {
        let json = r#"{"allocator": {"page_size": 3000}}"#;
        let err = Config::from_json(json).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn rejects_chunk_smaller_than_page() {
        let json = r#"{"allocator": {"default_chunk_size": 1024, "page_size": 4096}}"#;
        assert!(Config::from_json(json).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("config parse error"));
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = Config::default();
        config.provider.limit_bytes = Some(DEFAULT_CHUNK_SIZE);
        let json = config.to_json().unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }
}
