//! Configuration validation
//!
//! Validates engine configuration for correctness before any store is opened:
//! - Namespace never contains the `:` that separates it from table names
//! - Pool and batch sizes are positive and within SQLite limits
//! - Retry policy is well formed

use super::engine_config::EngineConfig;
use crate::CacheError;

/// Largest id list bound into a single statement
pub const MAX_READ_BATCH_SIZE: usize = 10_000;

/// Largest number of records committed in one transaction
pub const MAX_MERGE_BATCH_SIZE: usize = 10_000;

/// Retry counts above this turn transient errors into hangs
pub const MAX_RETRIES: u32 = 20;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate an engine configuration
pub fn validate_config(config: &EngineConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if !config
        .namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        errors.push(ValidationError::new(
            "namespace",
            format!(
                "Invalid namespace '{}'. Only ASCII letters, digits and '_' are allowed",
                config.namespace
            ),
        ));
    }

    // Store
    if config.store.path.as_os_str().is_empty() {
        errors.push(ValidationError::new("store.path", "Store path cannot be empty"));
    }

    if config.store.pool_size == 0 {
        errors.push(ValidationError::new(
            "store.pool_size",
            "Pool size must be greater than 0",
        ));
    }

    // Batching
    if config.merge_batch_size == 0 || config.merge_batch_size > MAX_MERGE_BATCH_SIZE {
        errors.push(ValidationError::new(
            "merge_batch_size",
            format!(
                "Merge batch size must be between 1 and {}, got {}",
                MAX_MERGE_BATCH_SIZE, config.merge_batch_size
            ),
        ));
    }

    if config.read_batch_size == 0 || config.read_batch_size > MAX_READ_BATCH_SIZE {
        errors.push(ValidationError::new(
            "read_batch_size",
            format!(
                "Read batch size must be between 1 and {}, got {}",
                MAX_READ_BATCH_SIZE, config.read_batch_size
            ),
        ));
    }

    // Retry policy
    let retry = &config.retry;
    if retry.max_retries > MAX_RETRIES {
        errors.push(ValidationError::new(
            "retry.max_retries",
            format!("At most {} retries are allowed", MAX_RETRIES),
        ));
    }

    if retry.max_backoff_ms < retry.backoff_ms {
        errors.push(ValidationError::new(
            "retry.max_backoff_ms",
            format!(
                "Backoff ceiling ({}ms) is below the initial backoff ({}ms)",
                retry.max_backoff_ms, retry.backoff_ms
            ),
        ));
    }

    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "retry.multiplier",
            format!("Multiplier must be at least 1.0, got {}", retry.multiplier),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &EngineConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        CacheError::Configuration(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = EngineConfig::for_path("/tmp/cache.db").with_namespace("prod_eu");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_namespace() {
        let config = EngineConfig::for_path("/tmp/cache.db").with_namespace("prod-eu");
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "namespace");

        let separator = EngineConfig::for_path("/tmp/cache.db").with_namespace("a:b");
        assert!(validate_config(&separator).is_err());
    }

    #[test]
    fn test_zero_batch_sizes() {
        let config = EngineConfig::for_path("/tmp/cache.db").with_batch_sizes(0, 0);
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "merge_batch_size"));
        assert!(errors.iter().any(|e| e.field == "read_batch_size"));
    }

    #[test]
    fn test_batch_sizes_are_independent() {
        let config = EngineConfig::for_path("/tmp/cache.db").with_batch_sizes(10, 2_000);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_bad_retry_policy() {
        let mut config = EngineConfig::for_path("/tmp/cache.db");
        config.retry.max_retries = 100;
        config.retry.backoff_ms = 500;
        config.retry.max_backoff_ms = 100;
        config.retry.multiplier = 0.5;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_zero_pool_size() {
        let mut config = EngineConfig::for_path("/tmp/cache.db");
        config.store.pool_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_config_result_collects_messages() {
        let mut config = EngineConfig::for_path("");
        config.store.pool_size = 0;

        let err = validate_config_result(&config).unwrap_err();
        match err {
            CacheError::Configuration(msg) => {
                assert!(msg.contains("store.path"));
                assert!(msg.contains("store.pool_size"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
