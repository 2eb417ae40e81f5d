//! Update error types

use armada_infra::{AgentError, CloudError};
use armada_plan::PlanError;
use armada_store::StoreError;
use thiserror::Error;
use tokio::task::JoinError;

/// Update errors
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Too many instance updates of the job failed; stop rolling out
    #[error("Update of job `{job}' was rolled back after {errors} failed instance updates")]
    RollbackTriggered { job: String, errors: u32 },

    #[error("Not enough disk space to update `{instance}'")]
    NotEnoughDiskSpace { instance: String },

    #[error("`{instance}' is not running after update")]
    UnhealthyAfterUpdate { instance: String },

    #[error("`{instance}' is still running despite the stop command")]
    StillRunningAfterStop { instance: String },

    #[error("`{instance}' has invalid disks: agent reports `{agent}' while director record shows `{director}'")]
    AgentDiskOutOfSync {
        instance: String,
        agent: String,
        director: String,
    },

    #[error("`{instance}' VM has disk attached but it's not reflected in director DB")]
    AgentUnexpectedDisk { instance: String },

    #[error("`{instance}' VM should have persistent disk `{disk_cid}' attached but it doesn't (according to CPI)")]
    CloudDiskNotAttached { instance: String, disk_cid: String },

    #[error("Disk `{disk_cid}' is missing according to CPI but marked as active in DB")]
    CloudDiskMissing { disk_cid: String },

    #[error("VM {vm} is missing agent id")]
    VmAgentIdMissing { vm: String },

    #[error("VM of `{instance}' has no cloud id")]
    VmCidMissing { instance: String },

    #[error("Worker task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<JoinError> for UpdateError {
    fn from(err: JoinError) -> Self {
        UpdateError::TaskPanicked(err.to_string())
    }
}

/// Result type for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;
