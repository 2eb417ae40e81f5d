//! Agent-reported state and instance target states

use crate::error::TypesError;
use crate::network::NetworkSettingsMap;
use crate::spec::{ApplySpec, JobSpec, PackageSpec, ReleaseRef, ResourcePoolSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Job state reported by a healthy agent
pub const JOB_STATE_RUNNING: &str = "running";

/// What an instance should be doing once the deploy finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Started,
    Stopped,
    Detached,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Started => "started",
            TargetState::Stopped => "stopped",
            TargetState::Detached => "detached",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(TargetState::Started),
            "stopped" => Ok(TargetState::Stopped),
            "detached" => Ok(TargetState::Detached),
            other => Err(TypesError::UnknownTargetState(other.to_string())),
        }
    }
}

/// State reported by an agent through `get_state`
///
/// Every field is optional: a freshly created VM knows very little about
/// itself until the first apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub release: Option<ReleaseRef>,
    #[serde(default)]
    pub job: Option<JobSpec>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub networks: NetworkSettingsMap,
    #[serde(default)]
    pub resource_pool: Option<ResourcePoolSnapshot>,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageSpec>,
    #[serde(default)]
    pub persistent_disk: u64,
    #[serde(default)]
    pub configuration_hash: Option<String>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub job_state: Option<String>,
}

impl AgentState {
    pub fn is_running(&self) -> bool {
        self.job_state.as_deref() == Some(JOB_STATE_RUNNING)
    }

    pub fn job_name(&self) -> Option<&str> {
        self.job.as_ref().map(|job| job.name.as_str())
    }

    /// State an agent reports right after applying `spec`
    pub fn from_apply_spec(spec: &ApplySpec, job_state: Option<String>) -> Self {
        Self {
            deployment: Some(spec.deployment.clone()),
            release: spec.release.clone(),
            job: spec.job.clone(),
            index: spec.index,
            networks: spec.networks.clone(),
            resource_pool: spec.resource_pool.clone(),
            packages: spec.packages.clone(),
            persistent_disk: spec.persistent_disk,
            configuration_hash: spec.configuration_hash.clone(),
            properties: spec.properties.clone(),
            job_state,
        }
    }

    /// Spec that reproduces this state when applied to `deployment`
    pub fn to_apply_spec(&self, deployment: &str) -> ApplySpec {
        ApplySpec {
            deployment: deployment.to_string(),
            release: self.release.clone(),
            job: self.job.clone(),
            index: self.index,
            networks: self.networks.clone(),
            resource_pool: self.resource_pool.clone(),
            packages: self.packages.clone(),
            persistent_disk: self.persistent_disk,
            configuration_hash: self.configuration_hash.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_state_round_trip_through_str() {
        for state in [TargetState::Started, TargetState::Stopped, TargetState::Detached] {
            assert_eq!(state.as_str().parse::<TargetState>().unwrap(), state);
        }
        assert!("recreate".parse::<TargetState>().is_err());
    }

    #[test]
    fn test_agent_state_tolerates_sparse_payload() {
        let state: AgentState =
            serde_json::from_str(r#"{"deployment":"web","job_state":"running"}"#).unwrap();
        assert_eq!(state.deployment.as_deref(), Some("web"));
        assert!(state.is_running());
        assert!(state.networks.is_empty());
        assert_eq!(state.persistent_disk, 0);
    }
}
