//! Creation and refresh of resource pool VMs

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::pool::BoundedWorkerPool;
use armada_infra::VmRequest;
use armada_plan::{DeploymentPlan, IdleVm, PlanError};
use armada_store::{RecordId, VmRecord};
use armada_types::{AgentState, ApplySpec, NetworkSettingsMap, ResourcePoolSnapshot};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Position of a VM slot inside a resource pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle(usize),
    Allocated(usize),
}

/// One VM to (re)create
#[derive(Debug)]
struct VmWork {
    pool: usize,
    slot: Slot,
    deployment_id: RecordId,
    outdated: Option<VmRecord>,
    request: VmRequest,
    state: ApplySpec,
}

#[derive(Debug)]
struct CreatedVm {
    pool: usize,
    slot: Slot,
    vm: VmRecord,
    state: AgentState,
}

/// Creates missing idle VMs and recreates the ones that drifted
///
/// Covers both idle VMs and VMs already promised to an instance. A promised
/// VM that does not exist yet boots straight onto its instance's networks.
#[derive(Debug, Clone)]
pub struct ResourcePoolUpdater {
    ctx: UpdateContext,
}

impl ResourcePoolUpdater {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(deployment = %plan.name))]
    pub async fn update(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let work = collect_work(plan)?;
        if work.is_empty() {
            debug!("Resource pools are up to date");
            return Ok(());
        }
        info!(vms = work.len(), "Updating resource pools");

        let mut pool: BoundedWorkerPool<CreatedVm, UpdateError> =
            BoundedWorkerPool::new(self.ctx.settings.max_in_flight);
        for item in work {
            let ctx = self.ctx.clone();
            pool.process(async move { create_idle_vm(ctx, item).await });
        }

        let (created_vms, failure) = pool.settle().await;
        for created in created_vms {
            let resource_pool = &mut plan.resource_pools[created.pool];
            let idle = match created.slot {
                Slot::Idle(i) => &mut resource_pool.idle_vms[i],
                Slot::Allocated(i) => &mut resource_pool.allocated_vms[i],
            };
            idle.vm = Some(created.vm);
            idle.current_state = Some(created.state);
        }
        failure.map_or(Ok(()), Err)
    }
}

fn collect_work(plan: &DeploymentPlan) -> Result<Vec<VmWork>> {
    let deployment_id = plan.deployment_id()?;
    let mut work = Vec::new();

    for (pool_index, pool) in plan.resource_pools.iter().enumerate() {
        let snapshot = pool.spec();
        let stemcell_cid = pool
            .stemcell()
            .cid()
            .ok_or_else(|| PlanError::UnknownStemcell {
                name: pool.stemcell().name().to_string(),
                version: pool.stemcell().version().to_string(),
            })?
            .to_string();

        let slots = pool
            .idle_vms
            .iter()
            .enumerate()
            .map(|(i, vm)| (Slot::Idle(i), vm))
            .chain(
                pool.allocated_vms
                    .iter()
                    .enumerate()
                    .map(|(i, vm)| (Slot::Allocated(i), vm)),
            );

        for (slot, idle) in slots {
            let networks = plan.idle_vm_network_settings(pool, idle);
            if !needs_vm(idle, &snapshot, &networks, plan.recreate) {
                continue;
            }

            let mut state = ApplySpec::for_deployment(&plan.name);
            state.resource_pool = Some(snapshot.clone());
            state.networks = networks.clone();

            work.push(VmWork {
                pool: pool_index,
                slot,
                deployment_id,
                outdated: idle.vm.clone(),
                request: VmRequest {
                    agent_id: Uuid::new_v4().to_string(),
                    stemcell_cid: stemcell_cid.clone(),
                    cloud_properties: pool.cloud_properties().clone(),
                    networks,
                    disk_locality: Vec::new(),
                    env: pool.env().clone(),
                },
                state,
            });
        }
    }
    Ok(work)
}

fn needs_vm(
    idle: &IdleVm,
    snapshot: &ResourcePoolSnapshot,
    networks: &NetworkSettingsMap,
    recreate: bool,
) -> bool {
    idle.vm.is_none() || idle.changed(snapshot, networks, recreate)
}

async fn create_idle_vm(ctx: UpdateContext, work: VmWork) -> Result<CreatedVm> {
    if let Some(outdated) = &work.outdated {
        info!(vm = %outdated.id, cid = ?outdated.cid, "Deleting outdated idle VM");
        if let Some(cid) = &outdated.cid {
            ctx.cloud.delete_vm(cid).await?;
        }
        ctx.store.vms.destroy(outdated.id).await?;
    }

    let vm_cid = ctx.cloud.create_vm(&work.request).await?;
    info!(%vm_cid, agent_id = %work.request.agent_id, "Created idle VM");

    let mut vm = VmRecord::new(work.deployment_id, work.request.agent_id.clone());
    vm.cid = Some(vm_cid);
    vm.apply_spec = Some(work.state.clone());
    let vm = ctx.store.vms.create(vm).await?;

    let agent = ctx.agent(&vm.agent_id);
    agent.wait_until_ready().await?;
    let task = agent.apply(&work.state).await?;
    ctx.finish_task(agent.as_ref(), task).await?;
    let state = agent.get_state().await?;
    ctx.ticker.advance(1.0);

    Ok(CreatedVm {
        pool: work.pool,
        slot: work.slot,
        vm,
        state,
    })
}
