//! Deletion of VMs and instances the plan no longer needs

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::pool::BoundedWorkerPool;
use armada_infra::{CloudError, DrainReason};
use armada_plan::DeploymentPlan;
use armada_store::{InstanceRecord, PersistentDiskRecord, VmRecord};
use tracing::{debug, info, instrument, warn};

/// Deletes unneeded VMs and instances along with their disks
#[derive(Debug, Clone)]
pub struct InstanceDeleter {
    ctx: UpdateContext,
}

impl InstanceDeleter {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }

    /// Delete everything the compiled plan marked unneeded
    #[instrument(skip_all, fields(deployment = %plan.name))]
    pub async fn delete_unneeded(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let vms = std::mem::take(&mut plan.unneeded_vms);
        self.delete_vms(vms).await?;
        let instances = std::mem::take(&mut plan.unneeded_instances);
        self.delete_instances(instances).await
    }

    pub async fn delete_vms(&self, vms: Vec<VmRecord>) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }
        info!(vms = vms.len(), "Deleting unneeded VMs");

        let mut pool: BoundedWorkerPool<(), UpdateError> =
            BoundedWorkerPool::new(self.ctx.settings.max_in_flight);
        for vm in vms {
            let ctx = self.ctx.clone();
            pool.process(async move { delete_vm(&ctx, &vm).await });
        }
        pool.wait().await?;
        Ok(())
    }

    pub async fn delete_instances(&self, instances: Vec<InstanceRecord>) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        info!(instances = instances.len(), "Deleting unneeded instances");

        let mut pool: BoundedWorkerPool<(), UpdateError> =
            BoundedWorkerPool::new(self.ctx.settings.max_in_flight);
        for instance in instances {
            let ctx = self.ctx.clone();
            pool.process(async move { delete_instance(&ctx, instance).await });
        }
        pool.wait().await?;
        Ok(())
    }
}

async fn delete_vm(ctx: &UpdateContext, vm: &VmRecord) -> Result<()> {
    if let Some(cid) = &vm.cid {
        match ctx.cloud.delete_vm(cid).await {
            Ok(()) => debug!(vm_cid = %cid, "Deleted VM"),
            Err(CloudError::VmNotFound(_)) => warn!(vm_cid = %cid, "VM is already gone"),
            Err(err) => return Err(err.into()),
        }
    }
    ctx.store.vms.destroy(vm.id).await?;
    ctx.ticker.advance(1.0);
    Ok(())
}

async fn delete_instance(ctx: &UpdateContext, mut instance: InstanceRecord) -> Result<()> {
    let name = instance.name();
    let vm = match instance.vm_id {
        Some(vm_id) => ctx.store.vms.find(vm_id).await?,
        None => None,
    };

    if let Some(vm) = &vm {
        let agent = ctx.agent(&vm.agent_id);
        ctx.drain_and_stop(agent.as_ref(), DrainReason::Shutdown, None)
            .await?;
        if let Some(cid) = &vm.cid {
            match ctx.cloud.delete_vm(cid).await {
                Ok(()) => {}
                Err(CloudError::VmNotFound(_)) => warn!(instance = %name, vm_cid = %cid, "VM is already gone"),
                Err(err) => return Err(err.into()),
            }
        }
    }

    let instance_id = instance.id;
    let disks = ctx
        .store
        .persistent_disks
        .filter(&|disk: &PersistentDiskRecord| disk.instance_id == instance_id)
        .await?;
    for disk in disks {
        match ctx.cloud.delete_disk(&disk.disk_cid).await {
            Ok(()) => {}
            Err(CloudError::DiskNotFound(_)) if disk.active => {
                return Err(UpdateError::CloudDiskMissing {
                    disk_cid: disk.disk_cid,
                });
            }
            Err(CloudError::DiskNotFound(_)) => {
                warn!(instance = %name, disk_cid = %disk.disk_cid, "Inactive disk is already gone")
            }
            Err(err) => return Err(err.into()),
        }
        ctx.store.persistent_disks.destroy(disk.id).await?;
    }

    if let Some(vm) = vm {
        instance.vm_id = None;
        ctx.store.instances.save(&instance).await?;
        ctx.store.vms.destroy(vm.id).await?;
    }
    ctx.store.instances.destroy(instance.id).await?;
    ctx.ticker.advance(1.0);
    info!(instance = %name, "Deleted instance");
    Ok(())
}
