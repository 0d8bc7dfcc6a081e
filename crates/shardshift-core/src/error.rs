//! Error types for the migration engine.
//!
//! Recoverable conditions (running tasks, insufficient space) are reported
//! through `Disposition` values; everything here is a hard failure that either
//! feeds the retry path or needs operator attention.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for shardshift.
#[derive(Debug, Error)]
pub enum MigrationError {
    // Document store errors
    #[error("Document store error (status {status:?}): {message}")]
    DocumentStore { message: String, status: Option<u16> },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    // Source-of-truth errors
    #[error("Entity not found: {entity_id}")]
    EntityNotFound { entity_id: u64 },

    // Migration bookkeeping errors
    #[error("Unknown migration: {0}")]
    UnknownMigration(String),

    #[error("Invalid checkpoint for {migration}: {message}")]
    InvalidCheckpoint { migration: String, message: String },

    // Checkpoint store errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for shardshift operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MigrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MigrationError::Timeout(Duration::from_secs(0))
        } else {
            MigrationError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl MigrationError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MigrationError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a document store error from an HTTP status and response body.
    pub fn store(status: u16, message: impl Into<String>) -> Self {
        MigrationError::DocumentStore {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Check if this error is a transient transport failure worth retrying
    /// within the same tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrationError::Network { .. } | MigrationError::Timeout(_) => true,
            MigrationError::DocumentStore {
                status: Some(status),
                ..
            } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Whether the error means a task handle is no longer worth polling.
    pub fn is_task_gone(&self) -> bool {
        matches!(
            self,
            MigrationError::TaskNotFound { .. } | MigrationError::TaskFailed { .. }
        )
    }
}
