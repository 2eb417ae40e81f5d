//! Simulated agents

use armada_infra::{Agent, AgentError, AgentFactory, AgentResult, AgentTask, DrainReason};
use armada_types::{AgentState, ApplySpec, NetworkSettingsMap, JOB_STATE_RUNNING};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const JOB_STATE_STOPPED: &str = "stopped";
const JOB_STATE_FAILING: &str = "failing";

/// Faults shared by every agent of a fleet
#[derive(Debug)]
struct FleetFaults {
    start_supported: AtomicBool,
    failing_jobs: DashMap<String, ()>,
}

impl FleetFaults {
    fn job_state_after_start(&self, state: &AgentState) -> &'static str {
        match state.job_name() {
            Some(job) if self.failing_jobs.contains_key(job) => JOB_STATE_FAILING,
            _ => JOB_STATE_RUNNING,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An in-process agent that keeps whatever state it is given
#[derive(Debug)]
pub struct SimulatedAgent {
    id: String,
    state: Mutex<AgentState>,
    disks: Mutex<Vec<String>>,
    drain_script: Mutex<VecDeque<i64>>,
    calls: Mutex<Vec<String>>,
    faults: Arc<FleetFaults>,
}

impl SimulatedAgent {
    fn new(id: &str, state: AgentState, faults: Arc<FleetFaults>) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(state),
            disks: Mutex::new(Vec::new()),
            drain_script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            faults,
        }
    }

    fn record(&self, method: &str) {
        lock(&self.calls).push(method.to_string());
    }

    pub fn state(&self) -> AgentState {
        lock(&self.state).clone()
    }

    pub fn set_state(&self, state: AgentState) {
        *lock(&self.state) = state;
    }

    /// Disks the agent has mounted
    pub fn disks(&self) -> Vec<String> {
        lock(&self.disks).clone()
    }

    pub fn set_disks(&self, disks: Vec<String>) {
        *lock(&self.disks) = disks;
    }

    /// Drain times returned by the next drain calls, in order
    ///
    /// Once the script runs out every drain returns 0.
    pub fn script_drain(&self, times: impl IntoIterator<Item = i64>) {
        lock(&self.drain_script).extend(times);
    }

    /// RPC method names received so far, in order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        lock(&self.calls).iter().filter(|call| call.as_str() == method).count()
    }
}

#[async_trait]
impl Agent for SimulatedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_state(&self) -> AgentResult<AgentState> {
        self.record("get_state");
        Ok(self.state())
    }

    async fn get_task(&self, task_id: &str) -> AgentResult<AgentTask> {
        self.record("get_task");
        Ok(AgentTask::done(task_id, Value::Null))
    }

    async fn apply(&self, spec: &ApplySpec) -> AgentResult<AgentTask> {
        self.record("apply");
        let mut state = lock(&self.state);
        let job_state = state.job_state.clone();
        *state = AgentState::from_apply_spec(spec, job_state);
        if !self.faults.start_supported.load(Ordering::SeqCst) && state.job.is_some() {
            // Agents without the start call run their job as soon as it is applied
            state.job_state = Some(self.faults.job_state_after_start(&state).to_string());
        }
        Ok(AgentTask::done("apply", Value::Null))
    }

    async fn drain(&self, reason: DrainReason, _spec: Option<&ApplySpec>) -> AgentResult<AgentTask> {
        self.record(&format!("drain:{reason}"));
        let seconds = lock(&self.drain_script).pop_front().unwrap_or(0);
        Ok(AgentTask::done("drain", Value::from(seconds)))
    }

    async fn stop(&self) -> AgentResult<AgentTask> {
        self.record("stop");
        lock(&self.state).job_state = Some(JOB_STATE_STOPPED.to_string());
        Ok(AgentTask::done("stop", Value::Null))
    }

    async fn start(&self) -> AgentResult<()> {
        self.record("start");
        if !self.faults.start_supported.load(Ordering::SeqCst) {
            return Err(AgentError::Runtime("unknown message start".into()));
        }
        let mut state = lock(&self.state);
        state.job_state = Some(self.faults.job_state_after_start(&state).to_string());
        Ok(())
    }

    async fn mount_disk(&self, disk_cid: &str) -> AgentResult<AgentTask> {
        self.record("mount_disk");
        let mut disks = lock(&self.disks);
        if !disks.iter().any(|disk| disk == disk_cid) {
            disks.push(disk_cid.to_string());
        }
        Ok(AgentTask::done("mount_disk", Value::Null))
    }

    async fn unmount_disk(&self, disk_cid: &str) -> AgentResult<AgentTask> {
        self.record("unmount_disk");
        lock(&self.disks).retain(|disk| disk != disk_cid);
        Ok(AgentTask::done("unmount_disk", Value::Null))
    }

    async fn migrate_disk(&self, _old_disk_cid: &str, _new_disk_cid: &str) -> AgentResult<AgentTask> {
        self.record("migrate_disk");
        Ok(AgentTask::done("migrate_disk", Value::Null))
    }

    async fn list_disk(&self) -> AgentResult<Vec<String>> {
        self.record("list_disk");
        Ok(self.disks())
    }

    async fn prepare_network_change(&self, networks: &NetworkSettingsMap) -> AgentResult<()> {
        self.record("prepare_network_change");
        lock(&self.state).networks = networks.clone();
        Ok(())
    }

    async fn wait_until_ready(&self) -> AgentResult<()> {
        self.record("wait_until_ready");
        Ok(())
    }
}

/// Every simulated agent, keyed by agent id
#[derive(Debug)]
pub struct SimulatedFleet {
    agents: DashMap<String, Arc<SimulatedAgent>>,
    faults: Arc<FleetFaults>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            faults: Arc::new(FleetFaults {
                start_supported: AtomicBool::new(true),
                failing_jobs: DashMap::new(),
            }),
        }
    }

    /// Register an agent that is already running with `state`
    pub fn register(&self, agent_id: &str, state: AgentState) -> Arc<SimulatedAgent> {
        let agent = Arc::new(SimulatedAgent::new(agent_id, state, self.faults.clone()));
        self.agents.insert(agent_id.to_string(), agent.clone());
        agent
    }

    /// Agent of a freshly booted VM
    pub fn boot(&self, agent_id: &str) -> Arc<SimulatedAgent> {
        debug!(agent_id, "Booting simulated agent");
        self.register(agent_id, AgentState::default())
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<SimulatedAgent>> {
        self.agents.get(agent_id).map(|agent| agent.clone())
    }

    pub fn forget(&self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Make `start` fail the way agents predating the call do
    pub fn set_start_supported(&self, supported: bool) {
        self.faults.start_supported.store(supported, Ordering::SeqCst);
    }

    /// Instances of `job` never become healthy
    pub fn fail_job(&self, job: &str) {
        self.faults.failing_jobs.insert(job.to_string(), ());
    }
}

impl Default for SimulatedFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentFactory for SimulatedFleet {
    fn agent(&self, agent_id: &str) -> Arc<dyn Agent> {
        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(SimulatedAgent::new(agent_id, AgentState::default(), self.faults.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_types::JobSpec;

    fn spec_for(job: &str) -> ApplySpec {
        let mut spec = ApplySpec::for_deployment("web");
        spec.job = Some(JobSpec {
            name: job.into(),
            template: job.into(),
            version: "1".into(),
            sha1: "abc".into(),
            blobstore_id: "blob".into(),
        });
        spec
    }

    #[tokio::test]
    async fn test_apply_then_start_runs_the_job() {
        let fleet = SimulatedFleet::new();
        let agent = fleet.agent("agent-1");

        agent.apply(&spec_for("nginx")).await.unwrap();
        assert!(!agent.get_state().await.unwrap().is_running());

        agent.start().await.unwrap();
        let state = agent.get_state().await.unwrap();
        assert!(state.is_running());
        assert_eq!(state.deployment.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn test_failing_job_never_runs() {
        let fleet = SimulatedFleet::new();
        fleet.fail_job("nginx");
        let agent = fleet.agent("agent-1");

        agent.apply(&spec_for("nginx")).await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(
            agent.get_state().await.unwrap().job_state.as_deref(),
            Some(JOB_STATE_FAILING)
        );
    }

    #[tokio::test]
    async fn test_agents_without_start_run_on_apply() {
        let fleet = SimulatedFleet::new();
        fleet.set_start_supported(false);
        let agent = fleet.agent("agent-1");

        agent.apply(&spec_for("nginx")).await.unwrap();
        assert!(agent.get_state().await.unwrap().is_running());
        assert!(matches!(agent.start().await, Err(AgentError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_drain_script_and_disks() {
        let fleet = SimulatedFleet::new();
        let agent = fleet.boot("agent-1");
        agent.script_drain([-5, 0]);

        let first = agent.drain(DrainReason::Shutdown, None).await.unwrap();
        assert_eq!(first.value, Value::from(-5));
        let status = agent.drain(DrainReason::Status, None).await.unwrap();
        assert_eq!(status.value, Value::from(0));
        assert_eq!(agent.call_count("drain:status"), 1);

        agent.mount_disk("disk-1").await.unwrap();
        agent.mount_disk("disk-1").await.unwrap();
        assert_eq!(agent.list_disk().await.unwrap(), vec!["disk-1".to_string()]);
        agent.unmount_disk("disk-1").await.unwrap();
        assert!(agent.disks().is_empty());
    }
}
