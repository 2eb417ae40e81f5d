//! Cloud provider interface

use crate::error::CloudResult;
use armada_types::NetworkSettingsMap;
use async_trait::async_trait;
use serde_json::Value;

/// Everything the cloud needs to boot one VM
#[derive(Debug, Clone, PartialEq)]
pub struct VmRequest {
    pub agent_id: String,
    pub stemcell_cid: String,
    pub cloud_properties: Value,
    pub networks: NetworkSettingsMap,
    /// Disks the VM should be placed close to
    pub disk_locality: Vec<String>,
    pub env: Value,
}

/// Cloud provider operations used by the director
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Boot a VM and return its cloud id
    async fn create_vm(&self, request: &VmRequest) -> CloudResult<String>;

    async fn delete_vm(&self, vm_cid: &str) -> CloudResult<()>;

    /// Create a persistent disk of `size` MiB and return its cloud id
    async fn create_disk(&self, size: u64, vm_locality: Option<&str>) -> CloudResult<String>;

    async fn delete_disk(&self, disk_cid: &str) -> CloudResult<()>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CloudResult<()>;

    async fn configure_networks(&self, vm_cid: &str, networks: &NetworkSettingsMap)
        -> CloudResult<()>;
}
