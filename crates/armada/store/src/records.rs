//! Record kinds persisted by the director

use crate::repository::{Record, RecordId};
use armada_types::{ApplySpec, TargetState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! record {
    ($ty:ident, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> RecordId {
                self.id
            }

            fn set_id(&mut self, id: RecordId) {
                self.id = id;
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: RecordId,
    pub name: String,
    /// Last manifest deployed successfully
    #[serde(default)]
    pub manifest: Option<Value>,
}

impl DeploymentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RecordId::default(),
            name: name.into(),
            manifest: None,
        }
    }
}

record!(DeploymentRecord, "deployment");

/// A job instance slot (`job/index`) of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: RecordId,
    pub deployment_id: RecordId,
    pub job: String,
    pub index: u32,
    #[serde(default)]
    pub vm_id: Option<RecordId>,
    /// Target state persisted by the last deploy
    #[serde(default)]
    pub state: Option<TargetState>,
}

impl InstanceRecord {
    pub fn new(deployment_id: RecordId, job: impl Into<String>, index: u32) -> Self {
        Self {
            id: RecordId::default(),
            deployment_id,
            job: job.into(),
            index,
            vm_id: None,
            state: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }
}

record!(InstanceRecord, "instance");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: RecordId,
    pub deployment_id: RecordId,
    pub agent_id: String,
    /// Cloud id; `None` while the VM is being created
    #[serde(default)]
    pub cid: Option<String>,
    /// Last state applied through the agent
    #[serde(default)]
    pub apply_spec: Option<ApplySpec>,
}

impl VmRecord {
    pub fn new(deployment_id: RecordId, agent_id: impl Into<String>) -> Self {
        Self {
            id: RecordId::default(),
            deployment_id,
            agent_id: agent_id.into(),
            cid: None,
            apply_spec: None,
        }
    }
}

record!(VmRecord, "vm");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentDiskRecord {
    pub id: RecordId,
    pub instance_id: RecordId,
    pub disk_cid: String,
    /// Size in MiB
    pub size: u64,
    /// Inactive disks are attached but not yet registered with the agent
    pub active: bool,
}

impl PersistentDiskRecord {
    pub fn new(instance_id: RecordId, disk_cid: impl Into<String>, size: u64) -> Self {
        Self {
            id: RecordId::default(),
            instance_id,
            disk_cid: disk_cid.into(),
            size,
            active: false,
        }
    }
}

record!(PersistentDiskRecord, "persistent disk");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellRecord {
    pub id: RecordId,
    pub name: String,
    pub version: String,
    pub cid: String,
}

impl StemcellRecord {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        cid: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::default(),
            name: name.into(),
            version: version.into(),
            cid: cid.into(),
        }
    }
}

record!(StemcellRecord, "stemcell");

/// Job template of an uploaded release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: RecordId,
    pub release: String,
    pub name: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
    /// Packages the template needs on the VM
    #[serde(default)]
    pub package_names: Vec<String>,
}

record!(TemplateRecord, "template");

/// Source package of an uploaded release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: RecordId,
    pub release: String,
    pub name: String,
    pub version: String,
}

record!(PackageRecord, "package");

/// A package compiled against one stemcell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPackageRecord {
    pub id: RecordId,
    pub package_id: RecordId,
    pub stemcell_id: RecordId,
    pub build: u32,
    pub sha1: String,
    pub blobstore_id: String,
}

record!(CompiledPackageRecord, "compiled package");
