//! Deployment manifest input types
//!
//! The manifest is the operator's desired state. It is only deserialized
//! here; cross references and counts are checked when the plan is built.

use crate::error::{PlanError, Result};
use armada_network::{IpSpan, NetworkSpec};
use armada_types::{DefaultProperty, ReleaseRef, StemcellSpec, UpdateConfig, WatchRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub name: String,
    pub release: ReleaseRef,
    #[serde(default)]
    pub properties: Value,
    pub networks: Vec<NetworkSpec>,
    pub resource_pools: Vec<ResourcePoolManifest>,
    pub update: UpdateManifest,
    #[serde(default)]
    pub jobs: Vec<JobManifest>,
}

impl DeploymentManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolManifest {
    pub name: String,
    pub size: u32,
    pub stemcell: StemcellSpec,
    pub network: String,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub env: Value,
}

/// Update settings; at job level every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateManifest {
    #[serde(default)]
    pub canaries: Option<u32>,
    #[serde(default)]
    pub canary_watch_time: Option<WatchRange>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub update_watch_time: Option<WatchRange>,
    #[serde(default)]
    pub max_errors: Option<u32>,
}

/// Errors tolerated before a batch is rolled back, when not set anywhere
pub const DEFAULT_MAX_ERRORS: u32 = 1;

impl UpdateManifest {
    /// Resolve into a complete config, filling gaps from `parent`
    ///
    /// Without a parent (deployment level) every field but `max_errors` is
    /// required.
    pub fn resolve(&self, parent: Option<&UpdateConfig>) -> Result<UpdateConfig> {
        fn pick<T: Copy>(own: Option<T>, inherited: Option<T>, field: &'static str) -> Result<T> {
            own.or(inherited)
                .ok_or(PlanError::MissingUpdateSetting { field })
        }

        let config = UpdateConfig::new(
            pick(self.canaries, parent.map(|p| p.canaries), "canaries")?,
            pick(
                self.canary_watch_time,
                parent.map(|p| p.canary_watch_time),
                "canary_watch_time",
            )?,
            pick(self.max_in_flight, parent.map(|p| p.max_in_flight), "max_in_flight")?,
            pick(
                self.update_watch_time,
                parent.map(|p| p.update_watch_time),
                "update_watch_time",
            )?,
            self.max_errors
                .or(parent.map(|p| p.max_errors))
                .unwrap_or(DEFAULT_MAX_ERRORS),
        )?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub name: String,
    pub template: String,
    pub instances: u32,
    pub resource_pool: String,
    /// Persistent disk size in MiB, 0 for none
    #[serde(default)]
    pub persistent_disk: u64,
    pub networks: Vec<JobNetworkManifest>,
    #[serde(default)]
    pub update: Option<UpdateManifest>,
    /// Overrides the deployment properties for this job
    #[serde(default)]
    pub properties: Option<Value>,
    /// `started`, `stopped`, `detached`, `recreate` or `restart`
    #[serde(default)]
    pub state: Option<String>,
    /// Per-instance state overrides, keyed by index
    #[serde(default)]
    pub instance_states: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNetworkManifest {
    pub name: String,
    #[serde(default)]
    pub static_ips: Vec<IpSpan>,
    #[serde(default)]
    pub default: Vec<DefaultProperty>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment_update() -> UpdateConfig {
        UpdateManifest {
            canaries: Some(1),
            canary_watch_time: Some("1000-5000".parse().unwrap()),
            max_in_flight: Some(4),
            update_watch_time: Some(WatchRange::fixed(3000)),
            max_errors: None,
        }
        .resolve(None)
        .unwrap()
    }

    #[test]
    fn test_deployment_update_requires_all_fields() {
        let partial = UpdateManifest {
            canaries: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            partial.resolve(None),
            Err(PlanError::MissingUpdateSetting {
                field: "canary_watch_time"
            })
        ));
        assert_eq!(deployment_update().max_errors, DEFAULT_MAX_ERRORS);
    }

    #[test]
    fn test_job_update_inherits_missing_fields() {
        let parent = deployment_update();
        let job = UpdateManifest {
            max_in_flight: Some(10),
            max_errors: Some(3),
            ..Default::default()
        }
        .resolve(Some(&parent))
        .unwrap();

        assert_eq!(job.canaries, 1);
        assert_eq!(job.canary_watch_time, parent.canary_watch_time);
        assert_eq!(job.max_in_flight, 10);
        assert_eq!(job.max_errors, 3);
    }

    #[test]
    fn test_manifest_from_json() {
        let manifest = DeploymentManifest::from_json(
            r#"{
                "name": "web",
                "release": {"name": "appcloud", "version": "42"},
                "networks": [{"name": "a", "subnets": [{"range": "10.0.0.0/24", "gateway": "10.0.0.1"}]}],
                "resource_pools": [{"name": "small", "size": 2, "network": "a",
                                    "stemcell": {"name": "ubuntu", "version": "3"}}],
                "update": {"canaries": 1, "canary_watch_time": "1000-2000", "max_in_flight": 2,
                           "update_watch_time": 1000},
                "jobs": [{"name": "nginx", "template": "nginx", "instances": 1,
                          "resource_pool": "small", "networks": [{"name": "a"}],
                          "instance_states": {"0": "stopped"}}]
            }"#,
        );
        let manifest = manifest.unwrap();
        assert_eq!(manifest.jobs[0].instance_states.get(&0).map(String::as_str), Some("stopped"));
        assert_eq!(manifest.update.update_watch_time, Some(WatchRange::fixed(1000)));
    }
}
