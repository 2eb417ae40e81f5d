//! Update of a single instance
//!
//! An update walks through six steps, advancing the ticker once per step:
//!
//! 1. drain and stop the job
//! 2. recreate the VM if its resource pool drifted
//! 3. reconcile the persistent disk
//! 4. reconfigure networks
//! 5. apply the desired state (and start the job)
//! 6. watch the job until it reaches its target state
//!
//! A detached instance stops after the first step: its disk is detached and
//! its VM deleted.

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::watch::{watch_schedule, WATCH_INTERVALS};
use armada_infra::{Agent, AgentError, CloudError, DrainReason, VmRequest};
use armada_plan::{Change, InstanceOutcome, InstanceTarget};
use armada_store::{PersistentDiskRecord, VmRecord};
use armada_types::{AgentState, ApplySpec, TargetState};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Progress steps of one instance update
pub const UPDATE_STEPS: u32 = 6;

/// Brings one instance to its target
#[async_trait]
pub trait InstanceUpdate: Send + Sync {
    /// Update the instance described by `target`
    ///
    /// `canary` selects the canary watch window.
    async fn update(&self, target: InstanceTarget, canary: bool) -> Result<InstanceOutcome>;
}

/// Updates instances through the cloud and their agents
#[derive(Debug, Clone)]
pub struct InstanceUpdater {
    ctx: UpdateContext,
}

impl InstanceUpdater {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl InstanceUpdate for InstanceUpdater {
    #[instrument(skip_all, fields(instance = %target.name(), canary = canary))]
    async fn update(&self, target: InstanceTarget, canary: bool) -> Result<InstanceOutcome> {
        InstanceRun::new(self.ctx.clone(), target).run(canary).await
    }
}

/// Working state of one instance update
struct InstanceRun {
    ctx: UpdateContext,
    target: InstanceTarget,
    vm: VmRecord,
    current_state: AgentState,
    /// Disks the agent reported, fetched at most once per VM
    disk_list: Option<Vec<String>>,
}

impl InstanceRun {
    fn new(ctx: UpdateContext, target: InstanceTarget) -> Self {
        Self {
            ctx,
            vm: target.vm.clone(),
            current_state: target.current_state.clone(),
            target,
            disk_list: None,
        }
    }

    fn name(&self) -> String {
        self.target.name()
    }

    fn advance(&self) {
        self.ctx.ticker.advance(1.0 / f64::from(UPDATE_STEPS));
    }

    fn agent(&self) -> Result<Arc<dyn Agent>> {
        if self.vm.agent_id.is_empty() {
            return Err(UpdateError::VmAgentIdMissing {
                vm: self.vm.id.to_string(),
            });
        }
        Ok(self.ctx.agent(&self.vm.agent_id))
    }

    fn vm_cid(&self) -> Result<String> {
        self.vm.cid.clone().ok_or_else(|| UpdateError::VmCidMissing {
            instance: self.name(),
        })
    }

    async fn run(mut self, canary: bool) -> Result<InstanceOutcome> {
        info!(changes = ?self.target.changes, target_state = %self.target.target_state, "Updating instance");

        self.stop().await?;
        self.advance();

        if self.target.target_state == TargetState::Detached {
            self.detach_disk().await?;
            self.delete_vm().await?;
            info!("Instance detached");
            return Ok(self.into_outcome(true));
        }

        self.update_resource_pool(None).await?;
        self.advance();

        self.update_persistent_disk().await?;
        self.advance();

        self.update_networks().await?;
        self.advance();

        let spec = self.target.apply_spec.clone();
        self.apply_state(spec).await?;
        if self.target.target_state == TargetState::Started {
            self.start().await?;
        }
        self.advance();

        self.watch(canary).await?;
        self.advance();

        info!("Instance updated");
        Ok(self.into_outcome(false))
    }

    fn into_outcome(self, detached: bool) -> InstanceOutcome {
        InstanceOutcome {
            job: self.target.job,
            index: self.target.index,
            instance: self.target.instance,
            vm: (!detached).then_some(self.vm),
            current_state: (!detached).then_some(self.current_state),
            detached,
        }
    }

    // Step 1: drain and stop

    async fn stop(&self) -> Result<()> {
        let agent = self.agent()?;
        let shutdown = self.target.has_change(Change::ResourcePool)
            || self.target.has_change(Change::PersistentDisk)
            || self.target.has_change(Change::Network)
            || matches!(self.target.target_state, TargetState::Stopped | TargetState::Detached);

        let (reason, spec) = if shutdown {
            (DrainReason::Shutdown, None)
        } else {
            (DrainReason::Update, Some(&self.target.apply_spec))
        };
        self.ctx.drain_and_stop(agent.as_ref(), reason, spec).await
    }

    // VM and disk primitives

    async fn active_disk(&self) -> Result<Option<PersistentDiskRecord>> {
        let instance_id = self.target.instance.id;
        Ok(self
            .ctx
            .store
            .persistent_disks
            .first(&|disk: &PersistentDiskRecord| disk.instance_id == instance_id && disk.active)
            .await?)
    }

    async fn instance_disks(&self) -> Result<Vec<PersistentDiskRecord>> {
        let instance_id = self.target.instance.id;
        Ok(self
            .ctx
            .store
            .persistent_disks
            .filter(&|disk: &PersistentDiskRecord| disk.instance_id == instance_id)
            .await?)
    }

    fn disk_currently_attached(&self) -> bool {
        self.current_state.persistent_disk > 0
    }

    /// Disks mounted according to the agent
    async fn disk_info(&mut self) -> Result<Vec<String>> {
        if let Some(disks) = &self.disk_list {
            return Ok(disks.clone());
        }
        let disks = match self.agent()?.list_disk().await {
            Ok(disks) => disks,
            Err(AgentError::Runtime(message)) => {
                debug!(%message, "Agent cannot list disks, assuming the active disk");
                self.active_disk()
                    .await?
                    .map(|disk| disk.disk_cid)
                    .into_iter()
                    .collect()
            }
            Err(err) => return Err(err.into()),
        };
        self.disk_list = Some(disks.clone());
        Ok(disks)
    }

    async fn detach_disk(&mut self) -> Result<()> {
        if !self.disk_currently_attached() {
            return Ok(());
        }
        let disk = self
            .active_disk()
            .await?
            .ok_or_else(|| UpdateError::AgentUnexpectedDisk {
                instance: self.name(),
            })?;

        let agent = self.agent()?;
        let task = agent.unmount_disk(&disk.disk_cid).await?;
        self.ctx.finish_task(agent.as_ref(), task).await?;
        self.ctx
            .cloud
            .detach_disk(&self.vm_cid()?, &disk.disk_cid)
            .await?;
        self.disk_list = None;
        Ok(())
    }

    async fn attach_disk(&mut self) -> Result<()> {
        let Some(disk) = self.active_disk().await? else {
            return Ok(());
        };
        self.ctx
            .cloud
            .attach_disk(&self.vm_cid()?, &disk.disk_cid)
            .await?;
        let agent = self.agent()?;
        let task = agent.mount_disk(&disk.disk_cid).await?;
        self.ctx.finish_task(agent.as_ref(), task).await?;
        self.disk_list = None;
        Ok(())
    }

    async fn delete_vm(&mut self) -> Result<()> {
        if let Some(vm_cid) = &self.vm.cid {
            debug!(%vm_cid, "Deleting VM");
            self.ctx.cloud.delete_vm(vm_cid).await?;
        }
        self.target.instance.vm_id = None;
        self.ctx.store.instances.save(&self.target.instance).await?;
        self.ctx.store.vms.destroy(self.vm.id).await?;
        Ok(())
    }

    async fn create_vm(&mut self, new_disk: Option<&str>) -> Result<()> {
        let pool = &self.target.resource_pool;
        let disk_locality = self
            .active_disk()
            .await?
            .map(|disk| disk.disk_cid)
            .into_iter()
            .chain(new_disk.map(str::to_string))
            .collect();

        let request = VmRequest {
            agent_id: Uuid::new_v4().to_string(),
            stemcell_cid: pool.stemcell_cid.clone(),
            cloud_properties: pool.cloud_properties.clone(),
            networks: self.target.network_settings.clone(),
            disk_locality,
            env: pool.env.clone(),
        };
        let vm_cid = self.ctx.cloud.create_vm(&request).await?;
        debug!(%vm_cid, agent_id = %request.agent_id, "Created VM");

        let mut vm = VmRecord::new(self.target.deployment_id, request.agent_id);
        vm.cid = Some(vm_cid);
        self.vm = self.ctx.store.vms.create(vm).await?;
        self.target.instance.vm_id = Some(self.vm.id);
        self.ctx.store.instances.save(&self.target.instance).await?;
        self.disk_list = None;

        self.agent()?.wait_until_ready().await?;
        Ok(())
    }

    async fn apply_state(&mut self, spec: ApplySpec) -> Result<()> {
        self.vm.apply_spec = Some(spec.clone());
        self.ctx.store.vms.save(&self.vm).await?;

        let agent = self.agent()?;
        let task = agent.apply(&spec).await?;
        self.ctx.finish_task(agent.as_ref(), task).await?;
        Ok(())
    }

    // Step 2: resource pool

    /// Recreate the VM on resource pool drift, or to place it near `new_disk`
    async fn update_resource_pool(&mut self, new_disk: Option<String>) -> Result<()> {
        if !self.target.has_change(Change::ResourcePool) && new_disk.is_none() {
            return Ok(());
        }

        self.detach_disk().await?;
        let max_retries = self.ctx.settings.max_attach_disk_tries;
        let mut retries = 0;
        loop {
            self.delete_vm().await?;
            self.create_vm(new_disk.as_deref()).await?;
            match self.attach_disk().await {
                Ok(()) => break,
                Err(UpdateError::Cloud(err)) if err.is_retryable_disk_space() && retries < max_retries => {
                    retries += 1;
                    warn!(retries, "Retrying attach disk operation");
                }
                Err(UpdateError::Cloud(CloudError::NoDiskSpace { .. })) => {
                    warn!(retries, "Giving up on attach disk operation");
                    return Err(UpdateError::NotEnoughDiskSpace {
                        instance: self.name(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let mut state = ApplySpec::for_deployment(&self.target.deployment);
        state.networks = self.target.network_settings.clone();
        state.resource_pool = Some(self.target.resource_pool.snapshot.clone());
        state.job = self.target.apply_spec.job.clone();
        state.index = Some(self.target.index);
        state.release = self.target.apply_spec.release.clone();
        state.persistent_disk = self.target.persistent_disk;
        self.apply_state(state).await?;

        self.current_state = self.agent()?.get_state().await?;
        Ok(())
    }

    // Step 3: persistent disk

    async fn update_persistent_disk(&mut self) -> Result<()> {
        self.attach_missing_disk().await?;
        self.check_persistent_disk().await?;

        if !self.target.has_change(Change::PersistentDisk) {
            return Ok(());
        }

        let old_disk = self.active_disk().await?;
        let mut new_disk = None;

        if self.target.persistent_disk > 0 {
            let size = self.target.persistent_disk;
            let disk_cid = self
                .ctx
                .cloud
                .create_disk(size, Some(&self.vm_cid()?))
                .await?;
            let disk = self
                .ctx
                .store
                .persistent_disks
                .create(PersistentDiskRecord::new(self.target.instance.id, &disk_cid, size))
                .await?;
            info!(%disk_cid, size, "Created persistent disk");

            if let Err(err) = self.adopt_new_disk(&disk, old_disk.as_ref()).await {
                self.discard_disk(&disk).await;
                return Err(err);
            }
            new_disk = Some(disk);
        }

        let old_disk = match old_disk {
            Some(mut disk) => {
                disk.active = false;
                self.ctx.store.persistent_disks.save(&disk).await?;
                Some(disk)
            }
            None => None,
        };
        if let Some(mut disk) = new_disk {
            disk.active = true;
            self.ctx.store.persistent_disks.save(&disk).await?;
        }
        if let Some(disk) = old_disk {
            let vm_cid = self.vm.cid.clone();
            self.delete_disk(&disk, vm_cid.as_deref()).await?;
        }
        Ok(())
    }

    /// Attach, mount and migrate onto a freshly created disk
    async fn adopt_new_disk(
        &mut self,
        disk: &PersistentDiskRecord,
        old_disk: Option<&PersistentDiskRecord>,
    ) -> Result<()> {
        match self.ctx.cloud.attach_disk(&self.vm_cid()?, &disk.disk_cid).await {
            Ok(()) => {}
            Err(err) if err.is_retryable_disk_space() => {
                warn!(disk_cid = %disk.disk_cid, "Recreating VM to attach new persistent disk");
                self.update_resource_pool(Some(disk.disk_cid.clone())).await?;
                self.ctx
                    .cloud
                    .attach_disk(&self.vm_cid()?, &disk.disk_cid)
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        let agent = self.agent()?;
        let task = agent.mount_disk(&disk.disk_cid).await?;
        self.ctx.finish_task(agent.as_ref(), task).await?;
        if let Some(old_disk) = old_disk {
            let task = agent.migrate_disk(&old_disk.disk_cid, &disk.disk_cid).await?;
            self.ctx.finish_task(agent.as_ref(), task).await?;
        }
        Ok(())
    }

    async fn discard_disk(&mut self, disk: &PersistentDiskRecord) {
        let vm_cid = self.vm.cid.clone();
        if let Err(err) = self.delete_disk(disk, vm_cid.as_deref()).await {
            warn!(disk_cid = %disk.disk_cid, error = %err, "Failed to clean up new persistent disk");
        }
    }

    /// Unmount, detach and delete `disk`
    ///
    /// Missing or already detached disks are only an error when the disk is
    /// still marked active.
    async fn delete_disk(&mut self, disk: &PersistentDiskRecord, vm_cid: Option<&str>) -> Result<()> {
        let disk_cid = disk.disk_cid.as_str();
        if self.disk_info().await?.iter().any(|mounted| mounted == disk_cid) {
            let agent = self.agent()?;
            let task = agent.unmount_disk(disk_cid).await?;
            self.ctx.finish_task(agent.as_ref(), task).await?;
            self.disk_list = None;
        }

        if let Some(vm_cid) = vm_cid {
            match self.ctx.cloud.detach_disk(vm_cid, disk_cid).await {
                Ok(()) => {}
                Err(CloudError::DiskNotAttached { .. }) if disk.active => {
                    return Err(UpdateError::CloudDiskNotAttached {
                        instance: self.name(),
                        disk_cid: disk_cid.to_string(),
                    });
                }
                Err(CloudError::DiskNotAttached { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        match self.ctx.cloud.delete_disk(disk_cid).await {
            Ok(()) => {}
            Err(CloudError::DiskNotFound(_)) if disk.active => {
                return Err(UpdateError::CloudDiskMissing {
                    disk_cid: disk_cid.to_string(),
                });
            }
            Err(CloudError::DiskNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        self.ctx.store.persistent_disks.destroy(disk.id).await?;
        debug!(%disk_cid, "Deleted persistent disk");
        Ok(())
    }

    /// Attach the active disk if the VM came up without it
    async fn attach_missing_disk(&mut self) -> Result<()> {
        let Some(disk) = self.active_disk().await? else {
            return Ok(());
        };
        if self.disk_currently_attached() {
            return Ok(());
        }
        match self.attach_disk().await {
            Ok(()) => Ok(()),
            Err(UpdateError::Cloud(CloudError::NoDiskSpace { .. })) => {
                self.update_resource_pool(Some(disk.disk_cid)).await
            }
            Err(err) => Err(err),
        }
    }

    /// The agent must have mounted exactly the disk the store marks active
    async fn check_persistent_disk(&mut self) -> Result<()> {
        let disks = self.instance_disks().await?;
        if disks.is_empty() {
            return Ok(());
        }

        let agent_disk = self.disk_info().await?.into_iter().next();
        let active_disk = disks
            .iter()
            .find(|disk| disk.active)
            .map(|disk| disk.disk_cid.clone());
        if agent_disk != active_disk {
            return Err(UpdateError::AgentDiskOutOfSync {
                instance: self.name(),
                agent: agent_disk.unwrap_or_else(|| "none".into()),
                director: active_disk.unwrap_or_else(|| "none".into()),
            });
        }

        for disk in disks.iter().filter(|disk| !disk.active) {
            warn!(disk_cid = %disk.disk_cid, "Instance has an inactive disk");
        }
        Ok(())
    }

    // Step 4: networks

    async fn update_networks(&mut self) -> Result<()> {
        if !self.target.has_change(Change::Network) {
            return Ok(());
        }
        let agent = self.agent()?;
        agent
            .prepare_network_change(&self.target.network_settings)
            .await?;
        self.ctx
            .cloud
            .configure_networks(&self.vm_cid()?, &self.target.network_settings)
            .await?;
        agent.wait_until_ready().await?;
        Ok(())
    }

    // Step 5: start

    async fn start(&self) -> Result<()> {
        match self.agent()?.start().await {
            Ok(()) => Ok(()),
            Err(AgentError::Runtime(message)) if self.ctx.settings.tolerate_missing_start => {
                warn!(%message, "Agent does not support start, continuing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // Step 6: watch

    async fn watch(&mut self, canary: bool) -> Result<()> {
        let range = self.target.update.watch_range(canary);
        let agent = self.agent()?;
        let target_state = self.target.target_state;

        for delay in watch_schedule(range.min_ms(), range.max_ms(), WATCH_INTERVALS) {
            debug!(delay_ms = delay.as_millis() as u64, "Waiting to check instance status");
            tokio::time::sleep(delay).await;
            self.current_state = agent.get_state().await?;

            let settled = match target_state {
                TargetState::Started => self.current_state.is_running(),
                TargetState::Stopped => !self.current_state.is_running(),
                TargetState::Detached => true,
            };
            if settled {
                break;
            }
        }

        match target_state {
            TargetState::Started if !self.current_state.is_running() => {
                Err(UpdateError::UnhealthyAfterUpdate {
                    instance: self.name(),
                })
            }
            TargetState::Stopped if self.current_state.is_running() => {
                Err(UpdateError::StillRunningAfterStop {
                    instance: self.name(),
                })
            }
            _ => Ok(()),
        }
    }
}
