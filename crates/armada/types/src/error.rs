//! Value type errors

use thiserror::Error;

/// Errors raised while building shared value types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("Watch time should be an integer or a range of two integers, got `{0}'")]
    InvalidWatchTime(String),

    #[error("Min watch time {min} cannot be greater than max watch time {max}")]
    InvertedWatchRange { min: u64, max: u64 },

    #[error("max_in_flight must be between 1 and {limit}, got {value}")]
    InvalidMaxInFlight { value: u32, limit: u32 },

    #[error("Unknown target state `{0}'")]
    UnknownTargetState(String),
}
