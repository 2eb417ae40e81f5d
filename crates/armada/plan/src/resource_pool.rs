//! Resource pools and their idle VMs

use crate::error::{PlanError, Result};
use crate::manifest::ResourcePoolManifest;
use armada_store::{RecordId, VmRecord};
use armada_types::{AgentState, NetworkSettingsMap, ResourcePoolSnapshot, StemcellRef};
use serde_json::Value;
use std::net::Ipv4Addr;

/// Job and index an allocated VM has been promised to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub job: String,
    pub index: u32,
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job, self.index)
    }
}

/// A VM slot of a resource pool that runs no job
#[derive(Debug, Clone, Default)]
pub struct IdleVm {
    /// `None` until the VM is created
    pub vm: Option<VmRecord>,
    /// Last state reported by the agent
    pub current_state: Option<AgentState>,
    /// Dynamic address on the pool's network
    pub ip: Option<Ipv4Addr>,
    pub bound_instance: Option<InstanceKey>,
}

impl IdleVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// An idle VM that already exists
    pub fn existing(vm: VmRecord, current_state: AgentState) -> Self {
        Self {
            vm: Some(vm),
            current_state: Some(current_state),
            ip: None,
            bound_instance: None,
        }
    }

    /// True if the VM has to be recreated to match `snapshot` and `networks`
    ///
    /// A VM that does not exist yet is never considered changed; it is
    /// simply missing.
    pub fn changed(
        &self,
        snapshot: &ResourcePoolSnapshot,
        networks: &NetworkSettingsMap,
        recreate: bool,
    ) -> bool {
        if self.vm.is_none() {
            return false;
        }
        let Some(state) = &self.current_state else {
            return true;
        };
        recreate || state.resource_pool.as_ref() != Some(snapshot) || &state.networks != networks
    }
}

/// A homogeneous pool of VMs jobs draw from
#[derive(Debug, Clone)]
pub struct ResourcePool {
    name: String,
    size: u32,
    stemcell: StemcellRef,
    stemcell_id: Option<RecordId>,
    network: String,
    cloud_properties: Value,
    env: Value,
    pub idle_vms: Vec<IdleVm>,
    /// Idle VMs promised to an instance; kept until the instance is bound
    pub allocated_vms: Vec<IdleVm>,
    active_vms: u32,
    reserved: u32,
}

impl ResourcePool {
    pub fn new(manifest: &ResourcePoolManifest) -> Self {
        Self {
            name: manifest.name.clone(),
            size: manifest.size,
            stemcell: StemcellRef::new(&manifest.stemcell.name, &manifest.stemcell.version),
            stemcell_id: None,
            network: manifest.network.clone(),
            cloud_properties: manifest.cloud_properties.clone(),
            env: manifest.env.clone(),
            idle_vms: Vec::new(),
            allocated_vms: Vec::new(),
            active_vms: 0,
            reserved: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn stemcell(&self) -> &StemcellRef {
        &self.stemcell
    }

    /// Stemcell record id, once bound
    pub fn stemcell_id(&self) -> Option<RecordId> {
        self.stemcell_id
    }

    pub fn bind_stemcell(&mut self, id: RecordId, cid: &str) {
        self.stemcell_id = Some(id);
        self.stemcell.bind(cid);
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn cloud_properties(&self) -> &Value {
        &self.cloud_properties
    }

    pub fn env(&self) -> &Value {
        &self.env
    }

    pub fn active_vms(&self) -> u32 {
        self.active_vms
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Reserve capacity for one instance
    pub fn reserve_slot(&mut self) -> Result<()> {
        self.reserve_capacity(1)
    }

    /// Reserve capacity for `count` instances at once
    pub fn reserve_capacity(&mut self, count: u32) -> Result<()> {
        let needed = self.reserved.saturating_add(count);
        if needed > self.size {
            return Err(PlanError::PoolOversubscribed {
                resource_pool: self.name.clone(),
                needed,
                size: self.size,
            });
        }
        self.reserved = needed;
        Ok(())
    }

    pub fn add_idle_vm(&mut self, vm: IdleVm) {
        self.idle_vms.push(vm);
    }

    /// Move the most recently added idle VM to the allocated list
    ///
    /// Returns its position in the allocated list.
    pub fn allocate_vm(&mut self) -> Result<usize> {
        let vm = self.idle_vms.pop().ok_or_else(|| PlanError::NoIdleVm {
            resource_pool: self.name.clone(),
        })?;
        self.allocated_vms.push(vm);
        Ok(self.allocated_vms.len() - 1)
    }

    /// Count a VM that is already running a job of this pool
    pub fn mark_active(&mut self) {
        self.active_vms += 1;
    }

    /// VM slots with no VM behind them at all
    pub fn missing_vm_count(&self) -> u32 {
        let present = self.active_vms as usize + self.idle_vms.len() + self.allocated_vms.len();
        (self.size as usize).saturating_sub(present) as u32
    }

    /// Idle VMs beyond the pool size
    pub fn extra_vm_count(&self) -> u32 {
        let present = self.active_vms as usize + self.idle_vms.len() + self.allocated_vms.len();
        present.saturating_sub(self.size as usize).min(self.idle_vms.len()) as u32
    }

    /// Snapshot compared against the agent's reported resource pool
    pub fn spec(&self) -> ResourcePoolSnapshot {
        ResourcePoolSnapshot {
            name: self.name.clone(),
            cloud_properties: self.cloud_properties.clone(),
            stemcell: self.stemcell.spec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_types::StemcellSpec;

    fn pool(size: u32) -> ResourcePool {
        ResourcePool::new(&ResourcePoolManifest {
            name: "small".into(),
            size,
            stemcell: StemcellSpec {
                name: "ubuntu".into(),
                version: "3".into(),
            },
            network: "a".into(),
            cloud_properties: Value::Null,
            env: Value::Null,
        })
    }

    #[test]
    fn test_reservation_never_exceeds_size() {
        let mut pool = pool(2);
        pool.reserve_slot().unwrap();
        pool.reserve_slot().unwrap();

        let err = pool.reserve_slot().unwrap_err();
        assert!(matches!(
            err,
            PlanError::PoolOversubscribed { needed: 3, size: 2, .. }
        ));
        assert_eq!(pool.reserved(), 2);
        assert!(pool.reserve_capacity(0).is_ok());
    }

    #[test]
    fn test_missing_vm_count_accounts_for_every_slot() {
        let mut pool = pool(5);
        assert_eq!(pool.missing_vm_count(), 5);

        pool.mark_active();
        pool.add_idle_vm(IdleVm::new());
        pool.add_idle_vm(IdleVm::new());
        pool.allocate_vm().unwrap();
        assert_eq!(pool.missing_vm_count(), 2);
        assert_eq!(pool.extra_vm_count(), 0);
    }

    #[test]
    fn test_allocate_takes_last_idle_vm() {
        let mut pool = pool(2);
        let mut first = IdleVm::new();
        first.ip = Some("10.0.0.2".parse().unwrap());
        let mut second = IdleVm::new();
        second.ip = Some("10.0.0.3".parse().unwrap());
        pool.add_idle_vm(first);
        pool.add_idle_vm(second);

        let slot = pool.allocate_vm().unwrap();
        assert_eq!(pool.allocated_vms[slot].ip, Some("10.0.0.3".parse().unwrap()));
        assert_eq!(pool.idle_vms.len(), 1);

        pool.allocate_vm().unwrap();
        assert!(matches!(pool.allocate_vm(), Err(PlanError::NoIdleVm { .. })));
    }

    #[test]
    fn test_extra_vms_beyond_size() {
        let mut pool = pool(1);
        pool.mark_active();
        pool.add_idle_vm(IdleVm::new());
        pool.add_idle_vm(IdleVm::new());
        assert_eq!(pool.extra_vm_count(), 2);
        assert_eq!(pool.missing_vm_count(), 0);
    }

    #[test]
    fn test_idle_vm_change_detection() {
        let pool = pool(1);
        let snapshot = pool.spec();
        let networks = NetworkSettingsMap::new();

        assert!(!IdleVm::new().changed(&snapshot, &networks, true));

        let state = AgentState {
            resource_pool: Some(snapshot.clone()),
            ..Default::default()
        };
        let vm = IdleVm::existing(VmRecord::new(RecordId(1), "agent-1"), state);
        assert!(!vm.changed(&snapshot, &networks, false));
        assert!(vm.changed(&snapshot, &networks, true));

        let mut other = snapshot.clone();
        other.cloud_properties = serde_json::json!({"ram": 2048});
        assert!(vm.changed(&other, &networks, false));
    }
}
