//! Deploying a manifest end to end

use crate::context::DirectorContext;
use crate::error::Result;
use armada_plan::{DeploymentManifest, DeploymentPlan, DeploymentPlanCompiler, PlanError};
use armada_update::{
    InstanceDeleter, InstanceUpdater, InstanceVmBinder, JobUpdater, ResourcePoolUpdater,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What one deploy changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploySummary {
    pub deployment: String,
    pub deleted_vms: usize,
    pub deleted_instances: usize,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub instances: usize,
    /// Instances that needed an update when the job's turn came
    pub updated: usize,
}

impl DeploySummary {
    pub fn updated_instances(&self) -> usize {
        self.jobs.iter().map(|job| job.updated).sum()
    }
}

/// Drives a deployment from manifest to running instances
///
/// Every deploy holds the deployment's lock while it compiles the plan,
/// deletes what is no longer needed, brings resource pools up to date,
/// binds instances to their VMs and finally rolls out each job in manifest
/// order.
#[derive(Debug, Clone)]
pub struct Deployer {
    ctx: DirectorContext,
}

impl Deployer {
    pub fn new(ctx: DirectorContext) -> Self {
        Self { ctx }
    }

    /// Build and check a plan without touching the store, cloud or agents
    pub fn validate(manifest: &DeploymentManifest) -> Result<DeploymentPlan> {
        Ok(DeploymentPlan::from_manifest(manifest, false)?)
    }

    #[instrument(skip_all, fields(deployment = %manifest.name, recreate = recreate))]
    pub async fn deploy(&self, manifest: &DeploymentManifest, recreate: bool) -> Result<DeploySummary> {
        let mut plan = DeploymentPlan::from_manifest(manifest, recreate)?;

        let guard = self.ctx.locks.deployment_lock(&plan.name).acquire().await?;
        let result = self.run(&mut plan).await;
        if let Err(err) = guard.release().await {
            warn!(error = %err, "Failed to release deployment lock");
        }

        match &result {
            Ok(summary) => info!(
                updated = summary.updated_instances(),
                deleted_vms = summary.deleted_vms,
                deleted_instances = summary.deleted_instances,
                "Deploy finished"
            ),
            Err(err) => warn!(error = %err, "Deploy failed"),
        }
        result
    }

    async fn run(&self, plan: &mut DeploymentPlan) -> Result<DeploySummary> {
        let update = self.ctx.update_context();

        DeploymentPlanCompiler::new(self.ctx.store.clone(), self.ctx.agents.clone())
            .compile(plan)
            .await?;

        let mut summary = DeploySummary {
            deployment: plan.name.clone(),
            deleted_vms: plan.unneeded_vms.len(),
            deleted_instances: plan.unneeded_instances.len(),
            jobs: Vec::new(),
        };

        InstanceDeleter::new(update.clone())
            .delete_unneeded(plan)
            .await?;
        ResourcePoolUpdater::new(update.clone()).update(plan).await?;
        InstanceVmBinder::new(update.clone()).bind(plan).await?;

        let jobs = JobUpdater::new(Arc::new(InstanceUpdater::new(update)));
        let names: Vec<String> = plan.jobs.iter().map(|job| job.name.clone()).collect();
        for name in names {
            let job = plan
                .job(&name)
                .ok_or_else(|| PlanError::UnknownJob { job: name.clone() })?;
            let instances = job.instances.len();
            let updated = plan.changed_instances(job)?.len();

            jobs.update(plan, &name).await?;
            summary.jobs.push(JobSummary {
                name,
                instances,
                updated,
            });
        }

        self.record_manifest(plan).await?;
        Ok(summary)
    }

    /// Remember the manifest that is now deployed
    async fn record_manifest(&self, plan: &DeploymentPlan) -> Result<()> {
        let mut deployment = plan
            .deployment
            .clone()
            .ok_or_else(|| PlanError::DeploymentNotBound(plan.name.clone()))?;
        deployment.manifest = Some(plan.manifest.clone());
        self.ctx.store.deployments.save(&deployment).await?;
        Ok(())
    }
}
