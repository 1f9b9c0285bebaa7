//! Configuration system
//!
//! Loads `~/.config/cachegraph/config.yaml` (or any path) with:
//! - Backing store location and connection pool sizing
//! - Retry policy for storage work
//! - Merge and read batch sizes
//! - A namespace separating environments that share one store

mod engine_config;
pub mod validation;

pub use engine_config::{EngineConfig, StoreConfig};
pub use validation::{validate_config, validate_config_result, ValidationError};
