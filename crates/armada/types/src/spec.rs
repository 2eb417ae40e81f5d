//! Desired-state snapshots
//!
//! Every snapshot here is compared by value against what the agent reports,
//! so field order and optionality matter: two snapshots describe the same
//! configuration iff they are equal.

use crate::network::NetworkSettingsMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Release a deployment is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub version: String,
}

/// Stemcell identity as written in a resource pool snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StemcellSpec {
    pub name: String,
    pub version: String,
}

/// A resource pool's stemcell, with the cloud id once the compiler has bound it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemcellRef {
    name: String,
    version: String,
    cid: Option<String>,
}

impl StemcellRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            cid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Cloud id of the stemcell, `None` until bound
    pub fn cid(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    pub fn bind(&mut self, cid: impl Into<String>) {
        self.cid = Some(cid.into());
    }

    pub fn spec(&self) -> StemcellSpec {
        StemcellSpec {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Snapshot used to decide whether a VM has to be recreated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolSnapshot {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Value,
    pub stemcell: StemcellSpec,
}

/// Job template as pushed to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub template: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

/// Compiled package reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// `<package version>.<compiled build>`
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

/// Full desired state of one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplySpec {
    pub deployment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub networks: NetworkSettingsMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<ResourcePoolSnapshot>,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageSpec>,
    #[serde(default)]
    pub persistent_disk: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_hash: Option<String>,
    #[serde(default)]
    pub properties: Value,
}

impl ApplySpec {
    /// Bare state for a VM that belongs to a deployment but runs no job yet
    pub fn for_deployment(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            release: None,
            job: None,
            index: None,
            networks: NetworkSettingsMap::new(),
            resource_pool: None,
            packages: BTreeMap::new(),
            persistent_disk: 0,
            configuration_hash: None,
            properties: Value::Null,
        }
    }
}
