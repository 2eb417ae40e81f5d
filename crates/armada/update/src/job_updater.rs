//! Canary-gated rollout of one job

use crate::error::{Result, UpdateError};
use crate::instance_updater::InstanceUpdate;
use crate::pool::BoundedWorkerPool;
use armada_plan::{DeploymentPlan, InstanceOutcome, InstanceTarget, PlanError, UpdateErrorTracker};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Rolls a job out in two phases
///
/// Canaries go first with the canary watch window. The remaining changed
/// instances follow, `max_in_flight` at a time. A failed canary, or reaching
/// the job's `max_errors`, stops the rollout with
/// [`UpdateError::RollbackTriggered`].
#[derive(Clone)]
pub struct JobUpdater {
    updater: Arc<dyn InstanceUpdate>,
}

impl JobUpdater {
    pub fn new(updater: Arc<dyn InstanceUpdate>) -> Self {
        Self { updater }
    }

    #[instrument(skip(self, plan))]
    pub async fn update(&self, plan: &mut DeploymentPlan, job_name: &str) -> Result<()> {
        let job = plan.job(job_name).ok_or_else(|| PlanError::UnknownJob {
            job: job_name.to_string(),
        })?;
        let changed = plan.changed_instances(job)?;
        if changed.is_empty() {
            info!("No instances to update");
            return Ok(());
        }

        let update = job.update.clone();
        let errors = job.errors.clone();
        let canaries = (update.canaries as usize).min(changed.len());
        let (canary, batch) = changed.split_at(canaries);
        let max_in_flight = update.max_in_flight as usize;

        info!(
            instances = changed.len(),
            canaries,
            max_in_flight,
            "Updating job"
        );

        self.run_phase(plan, job_name, canary, true, max_in_flight, &errors)
            .await?;
        self.check_rollback(job_name, &errors)?;

        self.run_phase(plan, job_name, batch, false, max_in_flight, &errors)
            .await?;
        self.check_rollback(job_name, &errors)?;

        info!("Finished updating job");
        Ok(())
    }

    fn check_rollback(&self, job_name: &str, errors: &UpdateErrorTracker) -> Result<()> {
        if errors.should_rollback() {
            warn!(errors = errors.error_count(), "Rolling back job update");
            return Err(UpdateError::RollbackTriggered {
                job: job_name.to_string(),
                errors: errors.error_count(),
            });
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        plan: &mut DeploymentPlan,
        job_name: &str,
        indices: &[u32],
        canary: bool,
        max_in_flight: usize,
        errors: &Arc<UpdateErrorTracker>,
    ) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        debug!(canary, instances = indices.len(), "Starting phase");

        let targets = indices
            .iter()
            .map(|index| plan.instance_target(job_name, *index))
            .collect::<std::result::Result<Vec<InstanceTarget>, PlanError>>()?;

        let mut pool: BoundedWorkerPool<Option<InstanceOutcome>, UpdateError> =
            BoundedWorkerPool::new(max_in_flight);
        for target in targets {
            let updater = self.updater.clone();
            let errors = errors.clone();
            pool.process(async move {
                let name = target.name();
                if errors.should_rollback() {
                    debug!(instance = %name, "Skipping instance update after rollback");
                    return Ok(None);
                }
                match updater.update(target, canary).await {
                    Ok(outcome) => Ok(Some(outcome)),
                    Err(err) => {
                        error!(instance = %name, canary, error = %err, "Instance update failed");
                        errors.record_update_error(canary);
                        Ok(None)
                    }
                }
            });
        }

        // Record what did happen before reporting a pool failure
        let (outcomes, failure) = pool.settle().await;
        for outcome in outcomes.into_iter().flatten() {
            plan.apply_outcome(outcome)?;
        }
        failure.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for JobUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobUpdater").finish_non_exhaustive()
    }
}
