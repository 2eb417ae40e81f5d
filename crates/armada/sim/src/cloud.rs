//! Simulated cloud provider

use crate::agent::SimulatedFleet;
use armada_infra::{Cloud, CloudError, CloudResult, VmRequest};
use armada_types::NetworkSettingsMap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One call received by the simulated cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    CreateVm { agent_id: String },
    DeleteVm { vm_cid: String },
    CreateDisk { size: u64 },
    DeleteDisk { disk_cid: String },
    AttachDisk { vm_cid: String, disk_cid: String },
    DetachDisk { vm_cid: String, disk_cid: String },
    ConfigureNetworks { vm_cid: String },
}

#[derive(Debug, Clone)]
pub struct SimulatedVm {
    pub agent_id: String,
    pub request: VmRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDisk {
    /// Size in MiB
    pub size: u64,
    pub attached_to: Option<String>,
}

/// In-memory cloud that boots a simulated agent for every VM it creates
#[derive(Debug)]
pub struct SimulatedCloud {
    fleet: Arc<SimulatedFleet>,
    vms: DashMap<String, SimulatedVm>,
    disks: DashMap<String, SimulatedDisk>,
    next_id: AtomicU64,
    no_disk_space: AtomicU32,
    calls: Mutex<Vec<CloudCall>>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SimulatedCloud {
    pub fn new(fleet: Arc<SimulatedFleet>) -> Self {
        Self {
            fleet,
            vms: DashMap::new(),
            disks: DashMap::new(),
            next_id: AtomicU64::new(1),
            no_disk_space: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fleet(&self) -> &Arc<SimulatedFleet> {
        &self.fleet
    }

    fn next_cid(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn record(&self, call: CloudCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    /// The next `count` disk attachments fail with a retryable out-of-space error
    pub fn fail_attach_with_no_disk_space(&self, count: u32) {
        self.no_disk_space.store(count, Ordering::SeqCst);
    }

    /// Register a VM that exists before the simulation starts
    pub fn insert_vm(&self, vm_cid: &str, request: VmRequest) {
        self.vms.insert(
            vm_cid.to_string(),
            SimulatedVm {
                agent_id: request.agent_id.clone(),
                request,
            },
        );
    }

    /// Register a disk that exists before the simulation starts
    pub fn insert_disk(&self, disk_cid: &str, size: u64, attached_to: Option<&str>) {
        self.disks.insert(
            disk_cid.to_string(),
            SimulatedDisk {
                size,
                attached_to: attached_to.map(str::to_string),
            },
        );
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&CloudCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn vm(&self, vm_cid: &str) -> Option<SimulatedVm> {
        self.vms.get(vm_cid).map(|vm| vm.clone())
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    pub fn disk(&self, disk_cid: &str) -> Option<SimulatedDisk> {
        self.disks.get(disk_cid).map(|disk| disk.clone())
    }

    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }
}

#[async_trait]
impl Cloud for SimulatedCloud {
    async fn create_vm(&self, request: &VmRequest) -> CloudResult<String> {
        self.record(CloudCall::CreateVm {
            agent_id: request.agent_id.clone(),
        });
        let vm_cid = self.next_cid("vm");
        debug!(%vm_cid, agent_id = %request.agent_id, "Creating simulated VM");
        self.insert_vm(&vm_cid, request.clone());
        self.fleet.boot(&request.agent_id);
        Ok(vm_cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()> {
        self.record(CloudCall::DeleteVm {
            vm_cid: vm_cid.to_string(),
        });
        let (_, vm) = self
            .vms
            .remove(vm_cid)
            .ok_or_else(|| CloudError::VmNotFound(vm_cid.to_string()))?;
        for mut disk in self.disks.iter_mut() {
            if disk.attached_to.as_deref() == Some(vm_cid) {
                disk.attached_to = None;
            }
        }
        self.fleet.forget(&vm.agent_id);
        Ok(())
    }

    async fn create_disk(&self, size: u64, _vm_locality: Option<&str>) -> CloudResult<String> {
        self.record(CloudCall::CreateDisk { size });
        let disk_cid = self.next_cid("disk");
        self.insert_disk(&disk_cid, size, None);
        Ok(disk_cid)
    }

    async fn delete_disk(&self, disk_cid: &str) -> CloudResult<()> {
        self.record(CloudCall::DeleteDisk {
            disk_cid: disk_cid.to_string(),
        });
        self.disks
            .remove(disk_cid)
            .map(|_| ())
            .ok_or_else(|| CloudError::DiskNotFound(disk_cid.to_string()))
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.record(CloudCall::AttachDisk {
            vm_cid: vm_cid.to_string(),
            disk_cid: disk_cid.to_string(),
        });
        if take_one(&self.no_disk_space) {
            return Err(CloudError::NoDiskSpace { ok_to_retry: true });
        }
        if !self.vms.contains_key(vm_cid) {
            return Err(CloudError::VmNotFound(vm_cid.to_string()));
        }
        let mut disk = self
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| CloudError::DiskNotFound(disk_cid.to_string()))?;
        disk.attached_to = Some(vm_cid.to_string());
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()> {
        self.record(CloudCall::DetachDisk {
            vm_cid: vm_cid.to_string(),
            disk_cid: disk_cid.to_string(),
        });
        let mut disk = self
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| CloudError::DiskNotFound(disk_cid.to_string()))?;
        if disk.attached_to.as_deref() != Some(vm_cid) {
            return Err(CloudError::DiskNotAttached {
                vm_cid: vm_cid.to_string(),
                disk_cid: disk_cid.to_string(),
            });
        }
        disk.attached_to = None;
        Ok(())
    }

    async fn configure_networks(&self, vm_cid: &str, networks: &NetworkSettingsMap) -> CloudResult<()> {
        self.record(CloudCall::ConfigureNetworks {
            vm_cid: vm_cid.to_string(),
        });
        let mut vm = self
            .vms
            .get_mut(vm_cid)
            .ok_or_else(|| CloudError::VmNotFound(vm_cid.to_string()))?;
        vm.request.networks = networks.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn request(agent_id: &str) -> VmRequest {
        VmRequest {
            agent_id: agent_id.into(),
            stemcell_cid: "stemcell-1".into(),
            cloud_properties: Value::Null,
            networks: NetworkSettingsMap::new(),
            disk_locality: Vec::new(),
            env: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_create_vm_boots_an_agent() {
        let fleet = Arc::new(SimulatedFleet::new());
        let cloud = SimulatedCloud::new(fleet.clone());

        let cid = cloud.create_vm(&request("agent-1")).await.unwrap();
        assert_eq!(cloud.vm(&cid).unwrap().agent_id, "agent-1");
        assert!(fleet.get("agent-1").is_some());

        cloud.delete_vm(&cid).await.unwrap();
        assert!(fleet.get("agent-1").is_none());
        assert!(matches!(
            cloud.delete_vm(&cid).await,
            Err(CloudError::VmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disk_attachment_faults() {
        let cloud = SimulatedCloud::new(Arc::new(SimulatedFleet::new()));
        let vm = cloud.create_vm(&request("agent-1")).await.unwrap();
        let disk = cloud.create_disk(1024, Some(&vm)).await.unwrap();

        cloud.fail_attach_with_no_disk_space(1);
        let err = cloud.attach_disk(&vm, &disk).await.unwrap_err();
        assert!(err.is_retryable_disk_space());

        cloud.attach_disk(&vm, &disk).await.unwrap();
        assert_eq!(cloud.disk(&disk).unwrap().attached_to.as_deref(), Some(vm.as_str()));

        assert!(matches!(
            cloud.detach_disk("vm-other", &disk).await,
            Err(CloudError::DiskNotAttached { .. })
        ));
        cloud.detach_disk(&vm, &disk).await.unwrap();
        assert_eq!(
            cloud.count_calls(|call| matches!(call, CloudCall::AttachDisk { .. })),
            2
        );
    }
}
