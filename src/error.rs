//! Error types for tillsync.
//!
//! `TillError` covers local failures (storage, configuration, validation).
//! Failures of the remote collaborator are reported separately through
//! [`RemoteError`] so the sync engine can keep them at item level.

use thiserror::Error;

/// Result type alias for tillsync operations
pub type TillResult<T> = Result<T, TillError>;

/// Main error type for local operations
#[derive(Error, Debug)]
pub enum TillError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Unsupported collection: {0}")]
    UnsupportedCollection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl TillError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        TillError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        TillError::DatabaseOperation(message.into())
    }

    /// Create a not-found error for a record in a collection
    pub fn record_not_found(collection: &str, key: &str) -> Self {
        TillError::NotFound(format!("{}:{}", collection, key))
    }
}

/// Errors returned by a remote collaborator.
///
/// The engine does not distinguish transient from permanent failures; both
/// leave the mutation queued. The split exists for logging and for callers
/// of the repository that talk to the remote directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or connectivity failure
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    /// The remote answered but refused the operation
    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The record does not exist remotely
    #[error("Remote record not found: {0}")]
    NotFound(String),

    /// The response could not be understood
    #[error("Invalid remote response: {0}")]
    InvalidResponse(String),
}
