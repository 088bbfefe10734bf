//! Error types for the storage layer.

use thiserror::Error;

/// Storage operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Persistence unreachable after bounded retries.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// SQLx error (connection, query, etc.)
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
