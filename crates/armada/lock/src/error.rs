//! Lock error types

use thiserror::Error;

/// Lock errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Failed to acquire lock for {name}")]
    LockTimeout { name: String },

    #[error("Lease store error: {0}")]
    Store(String),
}

/// Result type for lock operations
pub type Result<T> = std::result::Result<T, LockError>;
