//! Hand allocated resource pool VMs over to their instances

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::pool::BoundedWorkerPool;
use armada_plan::{DeploymentPlan, PlanError};
use armada_store::{InstanceRecord, VmRecord};
use armada_types::{AgentState, ApplySpec};
use tracing::{debug, info, instrument};

#[derive(Debug)]
struct Assignment {
    job: String,
    index: u32,
    instance: InstanceRecord,
    vm: VmRecord,
    spec: ApplySpec,
}

#[derive(Debug)]
struct Bound {
    job: String,
    index: u32,
    instance: InstanceRecord,
    vm: VmRecord,
    state: AgentState,
}

/// Binds every instance still waiting for a VM to the idle VM it was
/// allocated
///
/// The VM keeps its resource pool state and learns which job and index it
/// now runs; the instance update that follows does the rest.
#[derive(Debug, Clone)]
pub struct InstanceVmBinder {
    ctx: UpdateContext,
}

impl InstanceVmBinder {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(deployment = %plan.name))]
    pub async fn bind(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let assignments = collect_assignments(plan)?;
        if assignments.is_empty() {
            return Ok(());
        }
        info!(instances = assignments.len(), "Binding instance VMs");

        let mut pool: BoundedWorkerPool<Bound, UpdateError> =
            BoundedWorkerPool::new(self.ctx.settings.max_in_flight);
        for assignment in assignments {
            let ctx = self.ctx.clone();
            pool.process(async move { bind_instance_vm(ctx, assignment).await });
        }

        let (bindings, failure) = pool.settle().await;
        for bound in bindings {
            let instance = plan
                .job_mut(&bound.job)
                .and_then(|job| job.instance_mut(bound.index))
                .ok_or_else(|| PlanError::UnknownJob {
                    job: format!("{}/{}", bound.job, bound.index),
                })?;
            instance.record = Some(bound.instance);
            instance.vm = Some(bound.vm);
            instance.current_state = Some(bound.state);
        }
        failure.map_or(Ok(()), Err)
    }
}

fn collect_assignments(plan: &DeploymentPlan) -> Result<Vec<Assignment>> {
    let mut assignments = Vec::new();
    for job in &plan.jobs {
        let pool = plan
            .resource_pool(&job.resource_pool)
            .ok_or_else(|| PlanError::UnknownResourcePool {
                job: job.name.clone(),
                resource_pool: job.resource_pool.clone(),
            })?;

        for instance in &job.instances {
            if instance.is_detached() || instance.vm.is_some() {
                continue;
            }
            let Some(slot) = instance.idle_vm else {
                continue;
            };
            let not_bound = || PlanError::InstanceNotBound {
                instance: instance.name(),
            };
            let idle = pool.allocated_vms.get(slot).ok_or_else(not_bound)?;
            let vm = idle.vm.clone().ok_or_else(not_bound)?;
            let record = instance.record.clone().ok_or_else(not_bound)?;

            let mut spec = idle
                .current_state
                .clone()
                .unwrap_or_default()
                .to_apply_spec(&plan.name);
            spec.job = job.spec.clone();
            spec.index = Some(instance.index());
            spec.release = Some(plan.release.clone());

            assignments.push(Assignment {
                job: job.name.clone(),
                index: instance.index(),
                instance: record,
                vm,
                spec,
            });
        }
    }
    Ok(assignments)
}

async fn bind_instance_vm(ctx: UpdateContext, assignment: Assignment) -> Result<Bound> {
    let Assignment {
        job,
        index,
        mut instance,
        mut vm,
        spec,
    } = assignment;

    instance.vm_id = Some(vm.id);
    ctx.store.instances.save(&instance).await?;

    vm.apply_spec = Some(spec.clone());
    ctx.store.vms.save(&vm).await?;

    let agent = ctx.agent(&vm.agent_id);
    let task = agent.apply(&spec).await?;
    ctx.finish_task(agent.as_ref(), task).await?;
    let state = agent.get_state().await?;
    debug!(instance = %instance.name(), agent_id = %vm.agent_id, "Bound instance to VM");

    Ok(Bound {
        job,
        index,
        instance,
        vm,
        state,
    })
}
