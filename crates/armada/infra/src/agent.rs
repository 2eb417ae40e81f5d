//! Agent RPC interface and task polling

use crate::error::{AgentError, AgentResult};
use armada_types::{AgentState, ApplySpec, NetworkSettingsMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Why the agent is asked to drain its job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainReason {
    /// The VM is going away or being reconfigured
    Shutdown,
    /// The job is being updated in place
    Update,
    /// Follow-up query of a dynamic drain
    Status,
}

impl DrainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainReason::Shutdown => "shutdown",
            DrainReason::Update => "update",
            DrainReason::Status => "status",
        }
    }
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Done,
    Failed,
}

/// Handle of a long running agent call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub state: TaskState,
    /// Result once done, error message once failed
    #[serde(default)]
    pub value: Value,
}

impl AgentTask {
    pub fn running(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: TaskState::Running,
            value: Value::Null,
        }
    }

    pub fn done(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            state: TaskState::Done,
            value,
        }
    }

    pub fn failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: TaskState::Failed,
            value: Value::String(message.into()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

/// RPC surface of the agent running on every VM
///
/// Calls returning an [`AgentTask`] start work on the agent; use
/// [`wait_for_task`] to block until it finishes.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn get_state(&self) -> AgentResult<AgentState>;

    async fn get_task(&self, task_id: &str) -> AgentResult<AgentTask>;

    async fn apply(&self, spec: &ApplySpec) -> AgentResult<AgentTask>;

    /// Ask the job to drain; the task value is the drain time in seconds,
    /// negative when the agent wants to be polled with [`DrainReason::Status`]
    async fn drain(&self, reason: DrainReason, spec: Option<&ApplySpec>)
        -> AgentResult<AgentTask>;

    async fn stop(&self) -> AgentResult<AgentTask>;

    async fn start(&self) -> AgentResult<()>;

    async fn mount_disk(&self, disk_cid: &str) -> AgentResult<AgentTask>;

    async fn unmount_disk(&self, disk_cid: &str) -> AgentResult<AgentTask>;

    async fn migrate_disk(&self, old_disk_cid: &str, new_disk_cid: &str)
        -> AgentResult<AgentTask>;

    /// Disk cids the agent currently knows about
    async fn list_disk(&self) -> AgentResult<Vec<String>>;

    async fn prepare_network_change(&self, networks: &NetworkSettingsMap) -> AgentResult<()>;

    /// Block until the agent answers after a VM boot or reconfiguration
    async fn wait_until_ready(&self) -> AgentResult<()>;
}

/// Hands out an agent client per agent id
pub trait AgentFactory: Send + Sync {
    fn agent(&self, agent_id: &str) -> Arc<dyn Agent>;
}

/// Poll `task` every `interval` until it is no longer running
///
/// Returns the task value, or `TaskFailed` if the agent reported a failure.
pub async fn wait_for_task(
    agent: &dyn Agent,
    mut task: AgentTask,
    interval: Duration,
) -> AgentResult<Value> {
    while task.is_running() {
        tokio::time::sleep(interval).await;
        trace!(agent_id = agent.id(), task_id = %task.id, "Polling agent task");
        task = agent.get_task(&task.id).await?;
    }

    match task.state {
        TaskState::Failed => Err(AgentError::TaskFailed {
            message: task.value.as_str().unwrap_or("unknown error").to_string(),
            task_id: task.id,
        }),
        _ => Ok(task.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Agent whose task finishes after a fixed number of polls
    struct SlowAgent {
        polls: AtomicU32,
        finish_after: u32,
        fail: bool,
    }

    #[async_trait]
    impl Agent for SlowAgent {
        fn id(&self) -> &str {
            "slow"
        }

        async fn get_state(&self) -> AgentResult<AgentState> {
            Ok(AgentState::default())
        }

        async fn get_task(&self, task_id: &str) -> AgentResult<AgentTask> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls < self.finish_after {
                Ok(AgentTask::running(task_id))
            } else if self.fail {
                Ok(AgentTask::failed(task_id, "disk full"))
            } else {
                Ok(AgentTask::done(task_id, Value::from(42)))
            }
        }

        async fn apply(&self, _spec: &ApplySpec) -> AgentResult<AgentTask> {
            Ok(AgentTask::running("apply"))
        }

        async fn drain(&self, _: DrainReason, _: Option<&ApplySpec>) -> AgentResult<AgentTask> {
            Ok(AgentTask::done("drain", Value::from(0)))
        }

        async fn stop(&self) -> AgentResult<AgentTask> {
            Ok(AgentTask::done("stop", Value::Null))
        }

        async fn start(&self) -> AgentResult<()> {
            Ok(())
        }

        async fn mount_disk(&self, _: &str) -> AgentResult<AgentTask> {
            Ok(AgentTask::done("mount", Value::Null))
        }

        async fn unmount_disk(&self, _: &str) -> AgentResult<AgentTask> {
            Ok(AgentTask::done("unmount", Value::Null))
        }

        async fn migrate_disk(&self, _: &str, _: &str) -> AgentResult<AgentTask> {
            Ok(AgentTask::done("migrate", Value::Null))
        }

        async fn list_disk(&self) -> AgentResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn prepare_network_change(&self, _: &NetworkSettingsMap) -> AgentResult<()> {
            Ok(())
        }

        async fn wait_until_ready(&self) -> AgentResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_task_polls_until_done() {
        let agent = SlowAgent {
            polls: AtomicU32::new(0),
            finish_after: 3,
            fail: false,
        };
        let started = tokio::time::Instant::now();

        let value = wait_for_task(&agent, AgentTask::running("t1"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(value, Value::from(42));
        assert_eq!(agent.polls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_task_reports_failure() {
        let agent = SlowAgent {
            polls: AtomicU32::new(0),
            finish_after: 1,
            fail: true,
        };

        let err = wait_for_task(&agent, AgentTask::running("t2"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::TaskFailed {
                task_id: "t2".into(),
                message: "disk full".into()
            }
        );
    }

    #[tokio::test]
    async fn test_finished_task_is_not_polled() {
        let agent = SlowAgent {
            polls: AtomicU32::new(0),
            finish_after: 1,
            fail: false,
        };

        let value = wait_for_task(&agent, AgentTask::done("t3", Value::from(7)), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, Value::from(7));
        assert_eq!(agent.polls.load(Ordering::SeqCst), 0);
    }
}
