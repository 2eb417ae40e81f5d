//! Collaborators shared by every update stage

use crate::error::Result;
use armada_infra::{
    wait_for_task, Agent, AgentFactory, AgentTask, Cloud, DrainReason, NoopTicker, Ticker,
};
use armada_store::Store;
use armada_types::ApplySpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retries of a VM recreate when the cloud has no room for its disk
pub const MAX_ATTACH_DISK_TRIES: u32 = 3;

/// Tunables of the update stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Treat a runtime error from `start` as an agent that predates the call
    pub tolerate_missing_start: bool,
    pub max_attach_disk_tries: u32,
    /// Interval between polls of a running agent task
    #[serde(with = "millis")]
    pub task_poll_interval: Duration,
    /// Concurrent VM creations and deletions outside job rollouts
    pub max_in_flight: usize,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            tolerate_missing_start: true,
            max_attach_disk_tries: MAX_ATTACH_DISK_TRIES,
            task_poll_interval: Duration::from_secs(1),
            max_in_flight: crate::pool::DEFAULT_MAX_TASKS,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn drain_seconds(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

/// Store, cloud and agents, threaded through every update stage
#[derive(Clone)]
pub struct UpdateContext {
    pub store: Store,
    pub cloud: Arc<dyn Cloud>,
    pub agents: Arc<dyn AgentFactory>,
    pub ticker: Arc<dyn Ticker>,
    pub settings: UpdateSettings,
}

impl UpdateContext {
    pub fn new(store: Store, cloud: Arc<dyn Cloud>, agents: Arc<dyn AgentFactory>) -> Self {
        Self {
            store,
            cloud,
            agents,
            ticker: Arc::new(NoopTicker),
            settings: UpdateSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: UpdateSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = ticker;
        self
    }

    pub fn agent(&self, agent_id: &str) -> Arc<dyn Agent> {
        self.agents.agent(agent_id)
    }

    /// Wait for an agent task to finish and return its value
    pub async fn finish_task(&self, agent: &dyn Agent, task: AgentTask) -> Result<Value> {
        Ok(wait_for_task(agent, task, self.settings.task_poll_interval).await?)
    }

    /// Drain the job, wait for the drain to finish, then stop it
    ///
    /// A negative drain time means the job drains on its own schedule: wait
    /// that many seconds, then ask again with a status drain until the
    /// answer is no longer positive.
    pub async fn drain_and_stop(
        &self,
        agent: &dyn Agent,
        reason: DrainReason,
        spec: Option<&ApplySpec>,
    ) -> Result<()> {
        let task = agent.drain(reason, spec).await?;
        let drain_time = drain_seconds(&self.finish_task(agent, task).await?);

        if drain_time < 0 {
            let mut wait = drain_time.unsigned_abs();
            loop {
                info!(agent_id = agent.id(), seconds = wait, "Drain - check back later");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                match self.drain_status(agent).await {
                    Ok(remaining) if remaining > 0 => wait = remaining.unsigned_abs(),
                    Ok(_) => break,
                    Err(err) => {
                        warn!(agent_id = agent.id(), error = %err, "Failed to check drain status");
                        break;
                    }
                }
            }
        } else {
            debug!(agent_id = agent.id(), seconds = drain_time, "Waiting for drain");
            tokio::time::sleep(Duration::from_secs(drain_time.unsigned_abs())).await;
        }

        let task = agent.stop().await?;
        self.finish_task(agent, task).await?;
        Ok(())
    }

    async fn drain_status(&self, agent: &dyn Agent) -> Result<i64> {
        let task = agent.drain(DrainReason::Status, None).await?;
        Ok(drain_seconds(&self.finish_task(agent, task).await?))
    }
}

impl std::fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
