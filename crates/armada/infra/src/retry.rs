//! Timeout retries for idempotent agent calls

use crate::agent::{Agent, AgentFactory, AgentTask, DrainReason};
use crate::error::{AgentError, AgentResult};
use armada_types::{AgentState, ApplySpec, NetworkSettingsMap};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Agent decorator retrying `get_state` and `get_task` on timeout
///
/// Every other call changes agent state and is passed through untouched.
pub struct RetryingAgent {
    inner: Arc<dyn Agent>,
    retries: u32,
}

impl RetryingAgent {
    pub fn new(inner: Arc<dyn Agent>, retries: u32) -> Self {
        Self { inner, retries }
    }

    async fn with_retries<T, F, Fut>(&self, method: &str, mut call: F) -> AgentResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = AgentResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(AgentError::Timeout { .. }) if attempt < self.retries => {
                    attempt += 1;
                    warn!(agent_id = self.inner.id(), method, attempt, "Agent call timed out, retrying");
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Agent for RetryingAgent {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn get_state(&self) -> AgentResult<AgentState> {
        self.with_retries("get_state", || self.inner.get_state()).await
    }

    async fn get_task(&self, task_id: &str) -> AgentResult<AgentTask> {
        self.with_retries("get_task", || self.inner.get_task(task_id))
            .await
    }

    async fn apply(&self, spec: &ApplySpec) -> AgentResult<AgentTask> {
        self.inner.apply(spec).await
    }

    async fn drain(&self, reason: DrainReason, spec: Option<&ApplySpec>) -> AgentResult<AgentTask> {
        self.inner.drain(reason, spec).await
    }

    async fn stop(&self) -> AgentResult<AgentTask> {
        self.inner.stop().await
    }

    async fn start(&self) -> AgentResult<()> {
        self.inner.start().await
    }

    async fn mount_disk(&self, disk_cid: &str) -> AgentResult<AgentTask> {
        self.inner.mount_disk(disk_cid).await
    }

    async fn unmount_disk(&self, disk_cid: &str) -> AgentResult<AgentTask> {
        self.inner.unmount_disk(disk_cid).await
    }

    async fn migrate_disk(&self, old_disk_cid: &str, new_disk_cid: &str) -> AgentResult<AgentTask> {
        self.inner.migrate_disk(old_disk_cid, new_disk_cid).await
    }

    async fn list_disk(&self) -> AgentResult<Vec<String>> {
        self.inner.list_disk().await
    }

    async fn prepare_network_change(&self, networks: &NetworkSettingsMap) -> AgentResult<()> {
        self.inner.prepare_network_change(networks).await
    }

    async fn wait_until_ready(&self) -> AgentResult<()> {
        self.inner.wait_until_ready().await
    }
}

/// Factory wrapping every agent it hands out in a [`RetryingAgent`]
pub struct RetryingAgentFactory {
    inner: Arc<dyn AgentFactory>,
    retries: u32,
}

impl RetryingAgentFactory {
    pub fn new(inner: Arc<dyn AgentFactory>, retries: u32) -> Self {
        Self { inner, retries }
    }
}

impl AgentFactory for RetryingAgentFactory {
    fn agent(&self, agent_id: &str) -> Arc<dyn Agent> {
        Arc::new(RetryingAgent::new(self.inner.agent(agent_id), self.retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Times out the first `timeouts` calls of every kind
    struct FlakyAgent {
        timeouts: u32,
        state_calls: AtomicU32,
        apply_calls: AtomicU32,
    }

    impl FlakyAgent {
        fn timeout(&self, counter: &AtomicU32, method: &str) -> AgentResult<()> {
            if counter.fetch_add(1, Ordering::SeqCst) < self.timeouts {
                Err(AgentError::Timeout {
                    agent_id: "flaky".into(),
                    method: method.into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn get_state(&self) -> AgentResult<AgentState> {
            self.timeout(&self.state_calls, "get_state")?;
            Ok(AgentState::default())
        }

        async fn get_task(&self, task_id: &str) -> AgentResult<AgentTask> {
            Ok(AgentTask::done(task_id, Value::Null))
        }

        async fn apply(&self, _: &ApplySpec) -> AgentResult<AgentTask> {
            self.timeout(&self.apply_calls, "apply")?;
            Ok(AgentTask::done("apply", Value::Null))
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

    fn flaky(timeouts: u32) -> Arc<FlakyAgent> {
        Arc::new(FlakyAgent {
            timeouts,
            state_calls: AtomicU32::new(0),
            apply_calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_get_state_is_retried_on_timeout() {
        let inner = flaky(2);
        let agent = RetryingAgent::new(inner.clone(), 2);

        agent.get_state().await.unwrap();
        assert_eq!(inner.state_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let inner = flaky(5);
        let agent = RetryingAgent::new(inner.clone(), 2);

        assert!(matches!(
            agent.get_state().await,
            Err(AgentError::Timeout { .. })
        ));
        assert_eq!(inner.state_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_state_changing_calls_are_not_retried() {
        let inner = flaky(1);
        let agent = RetryingAgent::new(inner.clone(), 3);

        assert!(agent.apply(&ApplySpec::for_deployment("d")).await.is_err());
        assert_eq!(inner.apply_calls.load(Ordering::SeqCst), 1);
    }
}
