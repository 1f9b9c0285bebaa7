//! Error types for cachegraph
//!
//! Defines the error enum covering every failure mode of the engine and the
//! transient/permanent classification the retry executor relies on.
//! Uses thiserror for ergonomic error handling.

use crate::retry::{ClassifyFailure, FailureClass};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias for cachegraph operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for cachegraph operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid engine configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Physical table for a cache type could not be created
    #[error("Schema creation failed for type '{cache_type}': {message}")]
    SchemaCreation { cache_type: String, message: String },

    /// Transient failure that persisted through every retry
    #[error("Transient storage failure in {operation} after {attempts} attempts: {source}")]
    TransientStorage {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<CacheError>,
    },

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record rejected before reaching the store
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Malformed record key
    #[error("Invalid key: {0}")]
    Key(#[from] cache_record::KeyParseError),

    /// Blocking storage task panicked or was aborted
    #[error("Storage task failed: {0}")]
    Task(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl CacheError {
    /// Attempts made before this error surfaced, when it came out of the retry executor
    pub fn attempts(&self) -> Option<u32> {
        match self {
            CacheError::TransientStorage { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(e: tokio::task::JoinError) -> Self {
        CacheError::Task(e.to_string())
    }
}

impl ClassifyFailure for CacheError {
    fn failure_class(&self) -> FailureClass {
        match self {
            // Lock contention and connectivity blips
            CacheError::Database(e) => classify_sqlite(e),
            CacheError::Io(_) => FailureClass::Transient,

            // Already exhausted; never retried twice
            CacheError::TransientStorage { .. } => FailureClass::Permanent,

            // Structural, malformed or fatal
            CacheError::Configuration(_) => FailureClass::Permanent,
            CacheError::SchemaCreation { .. } => FailureClass::Permanent,
            CacheError::Json(_) => FailureClass::Permanent,
            CacheError::Yaml(_) => FailureClass::Permanent,
            CacheError::InvalidRecord(_) => FailureClass::Permanent,
            CacheError::Key(_) => FailureClass::Permanent,
            CacheError::Task(_) => FailureClass::Permanent,
            CacheError::Other(_) => FailureClass::Permanent,
        }
    }

    fn exhausted(self, operation: &str, attempts: u32) -> Self {
        CacheError::TransientStorage {
            operation: operation.to_string(),
            attempts,
            source: Box::new(self),
        }
    }
}

/// Classify a SQLite error by its primary result code
fn classify_sqlite(e: &rusqlite::Error) -> FailureClass {
    match e.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::OperationInterrupted,
        ) => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}
