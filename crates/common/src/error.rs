//! Error types for TestForge

use thiserror::Error;

/// Result type alias using TestForge Error
pub type Result<T> = std::result::Result<T, Error>;

/// TestForge error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad input shape or type; the caller can correct the request and retry.
    /// `step_index` is set when the offending field lives inside a step
    /// instance of a test case.
    #[error("validation failed: field '{field}': {reason}")]
    Validation {
        step_index: Option<usize>,
        field: String,
        reason: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Write attempted against an execution that already reached a terminal
    /// status.
    #[error("execution {id} is already finished")]
    StaleExecution { id: String },

    #[error("step executor error: {0}")]
    Executor(String),

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(
        step_index: Option<usize>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Validation {
            step_index,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}
