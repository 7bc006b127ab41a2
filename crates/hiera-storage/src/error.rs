//! Commit log error types.

use thiserror::Error;

/// Errors that can occur while persisting or replaying a commit log.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The persisted state is inconsistent.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

/// A specialized Result type for commit log operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
