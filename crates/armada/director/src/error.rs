//! Director error types

use thiserror::Error;

/// Director errors
#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Lock(#[from] armada_lock::LockError),

    #[error(transparent)]
    Plan(#[from] armada_plan::PlanError),

    #[error(transparent)]
    Update(#[from] armada_update::UpdateError),

    #[error(transparent)]
    Store(#[from] armada_store::StoreError),
}

/// Result type for director operations
pub type Result<T> = std::result::Result<T, DirectorError>;
