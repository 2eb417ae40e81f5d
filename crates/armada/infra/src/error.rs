//! Cloud and agent error types

use thiserror::Error;

/// Errors raised by the cloud provider interface
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The target host has no room for the disk; `ok_to_retry` means a
    /// recreated VM may land on a host that does
    #[error("No disk space (ok to retry: {ok_to_retry})")]
    NoDiskSpace { ok_to_retry: bool },

    #[error("Disk `{disk_cid}' is not attached to VM `{vm_cid}'")]
    DiskNotAttached { vm_cid: String, disk_cid: String },

    #[error("VM `{0}' not found")]
    VmNotFound(String),

    #[error("Disk `{0}' not found")]
    DiskNotFound(String),

    #[error("Cloud error: {0}")]
    Other(String),
}

impl CloudError {
    pub fn is_retryable_disk_space(&self) -> bool {
        matches!(self, CloudError::NoDiskSpace { ok_to_retry: true })
    }
}

/// Errors raised by agent RPC
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Timed out calling `{method}' on agent `{agent_id}'")]
    Timeout { agent_id: String, method: String },

    /// The agent received the call and failed to carry it out
    #[error("Agent runtime error: {0}")]
    Runtime(String),

    #[error("Agent RPC error: {0}")]
    Rpc(String),

    #[error("Agent task `{task_id}' failed: {message}")]
    TaskFailed { task_id: String, message: String },
}

/// Result type for cloud operations
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Result type for agent operations
pub type AgentResult<T> = std::result::Result<T, AgentError>;
