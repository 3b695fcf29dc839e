//! Configuration types for Tessera
//!
//! This module defines the configuration structures for the engine and its
//! read cache. Every field has a default so partial TOML files are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durability mode for journal records, commit markers and safe writes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// fsync every record and marker before relying on it
    #[default]
    Always,
    /// Leave flushing to the OS (fast, unsafe across power loss)
    Never,
}

impl SyncMode {
    /// Whether writes should be followed by an fsync
    pub fn should_sync(self) -> bool {
        self == Self::Always
    }
}

/// Root configuration for an engine instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root data directory (holds `partitions/` and the engine lock file)
    pub data_dir: PathBuf,
    /// Durability mode
    pub sync: SyncMode,
    /// Abort the process when a committed transaction cannot be applied
    pub abort_on_fatal: bool,
    /// TTL for decoded schema, contract and credential caches
    pub record_cache_ttl_secs: u64,
    /// Byte cache in front of partition file reads
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sync: SyncMode::default(),
            abort_on_fatal: true,
            record_cache_ttl_secs: 600,
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// TTL for decoded record caches
    pub fn record_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.record_cache_ttl_secs)
    }
}

/// Bounded byte cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Put the cache in front of partition file reads
    pub enabled: bool,
    /// Maximum resident bytes
    pub max_bytes: u64,
    /// Per-item TTL in seconds
    pub ttl_secs: u64,
    /// How often the sweeper drops expired items
    pub sweep_interval_secs: u64,
    /// Reads per second above which hits stop refreshing TTLs
    pub busy_rps_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 64 * 1024 * 1024, // 64 MiB
            ttl_secs: 600,
            sweep_interval_secs: 30,
            busy_rps_threshold: 1000,
        }
    }
}

impl CacheConfig {
    /// Per-item TTL
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.abort_on_fatal);
        assert_eq!(config.sync, SyncMode::Always);
        assert_eq!(config.cache.busy_rps_threshold, 1000);
        assert_eq!(config.record_cache_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            data_dir = "/srv/tessera"
            sync = "never"

            [cache]
            max_bytes = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/tessera"));
        assert_eq!(config.sync, SyncMode::Never);
        assert_eq!(config.cache.max_bytes, 1024);
        assert_eq!(config.cache.ttl_secs, 600);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let cache = CacheConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(cache.sweep_interval(), Duration::from_secs(1));
    }
}
