//! Store error types

use crate::repository::RecordId;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: RecordId },

    #[error("{kind} already has id {id}")]
    AlreadyPersisted { kind: &'static str, id: RecordId },

    #[error("Storage error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
