//! Common error types for matchcast

use thiserror::Error;

/// Common result type for matchcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across matchcast crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Concurrent writers modified the same record
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures of the record store (store unavailable, write conflict)
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Database(_) | Error::WriteConflict(_))
    }
}
