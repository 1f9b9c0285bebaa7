//! Engine configuration file handling
//!
//! Loads and saves the YAML configuration consumed by [`crate::CacheEngine`].

use crate::retry::RetryPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backing store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Enable WAL mode so readers never block on writers
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// How long SQLite itself waits on a locked database before reporting busy
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("cachegraph");
    path.push("cache.db");
    path
}

fn default_pool_size() -> usize {
    4
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    250
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            pool_size: default_pool_size(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// cachegraph engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix distinguishing environments that share one physical store
    #[serde(default)]
    pub namespace: String,

    /// Backing store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Retry policy applied to every unit of storage work
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Records per merge chunk (one transaction each)
    #[serde(default = "default_merge_batch_size")]
    pub merge_batch_size: usize,

    /// Ids per read query
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// Pause between merge chunks, to yield the store to other writers
    #[serde(default)]
    pub merge_pacing_ms: u64,

    /// Eviction skips stale ids another agent wrote last
    #[serde(default)]
    pub evict_own_writes_only: bool,
}

fn default_merge_batch_size() -> usize {
    100
}

fn default_read_batch_size() -> usize {
    500
}

impl EngineConfig {
    /// Create a configuration with defaults and the default store path
    pub fn new() -> Self {
        Self {
            namespace: String::new(),
            store: StoreConfig::default(),
            retry: RetryPolicy::default(),
            merge_batch_size: default_merge_batch_size(),
            read_batch_size: default_read_batch_size(),
            merge_pacing_ms: 0,
            evict_own_writes_only: false,
        }
    }

    /// Defaults pointed at a specific database file
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::new();
        config.store.path = path.into();
        config
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_sizes(mut self, merge_batch_size: usize, read_batch_size: usize) -> Self {
        self.merge_batch_size = merge_batch_size;
        self.read_batch_size = read_batch_size;
        self
    }

    pub fn merge_pacing(&self) -> Option<Duration> {
        (self.merge_pacing_ms > 0).then(|| Duration::from_millis(self.merge_pacing_ms))
    }

    /// Load configuration from the default path (~/.config/cachegraph/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::CacheError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading cachegraph configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            namespace = %config.namespace,
            merge_batch_size = config.merge_batch_size,
            read_batch_size = config.read_batch_size,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving cachegraph configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/cachegraph/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("cachegraph");
        path.push("config.yaml");
        path
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_creation() {
        let config = EngineConfig::new();
        assert_eq!(config.merge_batch_size, 100);
        assert_eq!(config.read_batch_size, 500);
        assert_eq!(config.store.pool_size, 4);
        assert!(config.store.wal_mode);
        assert!(config.store.path.ends_with("cachegraph/cache.db"));
    }

    #[test]
    fn test_merge_pacing() {
        let mut config = EngineConfig::new();
        assert_eq!(config.merge_pacing(), None);
        config.merge_pacing_ms = 25;
        assert_eq!(config.merge_pacing(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let config = EngineConfig::for_path("/tmp/cache.db")
            .with_namespace("prod")
            .with_batch_sizes(50, 200)
            .with_retry(RetryPolicy::new(7, 10));

        config.save(path).unwrap();

        let loaded = EngineConfig::load(path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
namespace: dev
store:
  path: /var/lib/cachegraph/cache.db
retry:
  max_retries: 9
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "dev");
        assert_eq!(config.store.pool_size, 4);
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.retry.backoff_ms, 50);
        assert_eq!(config.merge_batch_size, 100);
        assert!(!config.evict_own_writes_only);
    }

    #[test]
    fn test_default_path() {
        let path = EngineConfig::default_path();
        assert!(path.ends_with("cachegraph/config.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load("/nonexistent/config.yaml");
        assert!(matches!(result, Err(crate::CacheError::Configuration(_))));
    }
}
