//! Instances of a job and the drift between desired and live state

use armada_network::InstanceNetwork;
use armada_store::{InstanceRecord, VmRecord};
use armada_types::{AgentState, TargetState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One kind of drift an instance update has to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Operator asked for a restart
    Restart,
    /// Stemcell, cloud properties or forced recreate
    ResourcePool,
    Network,
    Packages,
    PersistentDisk,
    Configuration,
    Job,
    State,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Change::Restart => "restart",
            Change::ResourcePool => "resource_pool",
            Change::Network => "network",
            Change::Packages => "packages",
            Change::PersistentDisk => "persistent_disk",
            Change::Configuration => "configuration",
            Change::Job => "job",
            Change::State => "state",
        };
        f.write_str(name)
    }
}

/// Set of changes pending on one instance
pub type Changes = BTreeSet<Change>;

/// Desired and bound state of one job instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    job: String,
    index: u32,
    /// Persisted record, found or created by the compiler
    pub record: Option<InstanceRecord>,
    pub vm: Option<VmRecord>,
    /// Position of the adopted idle VM in the pool's allocated list
    pub idle_vm: Option<usize>,
    pub current_state: Option<AgentState>,
    pub configuration_hash: Option<String>,
    /// Target state from the manifest, before falling back to the record
    pub state_override: Option<TargetState>,
    /// Resolved target state
    pub target_state: Option<TargetState>,
    pub recreate: bool,
    pub restart: bool,
    pub networks: BTreeMap<String, InstanceNetwork>,
}

impl InstanceSpec {
    pub fn new(job: impl Into<String>, index: u32) -> Self {
        Self {
            job: job.into(),
            index,
            record: None,
            vm: None,
            idle_vm: None,
            current_state: None,
            configuration_hash: None,
            state_override: None,
            target_state: None,
            recreate: false,
            restart: false,
            networks: BTreeMap::new(),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// `job/index`, as used in logs and errors
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }

    pub fn add_network(&mut self, network: InstanceNetwork) {
        self.networks.insert(network.name().to_string(), network);
    }

    pub fn is_detached(&self) -> bool {
        self.target_state == Some(TargetState::Detached)
    }
}
