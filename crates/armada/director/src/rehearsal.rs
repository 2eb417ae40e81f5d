//! Deploys against the simulated fleet
//!
//! A rehearsal needs the stemcells and templates the manifest refers to.
//! They are registered as empty simulated uploads so the compiler can bind
//! them.

use crate::config::DirectorConfig;
use crate::context::DirectorContext;
use crate::error::Result;
use armada_lock::InMemoryLeaseStore;
use armada_plan::DeploymentManifest;
use armada_sim::{SimulatedCloud, SimulatedFleet};
use armada_store::{RecordId, StemcellRecord, Store, TemplateRecord};
use std::sync::Arc;
use tracing::debug;

/// Director context over an in-memory store and a simulated cloud
pub fn simulated_context(config: DirectorConfig) -> (DirectorContext, Arc<SimulatedCloud>) {
    let fleet = Arc::new(SimulatedFleet::new());
    let cloud = Arc::new(SimulatedCloud::new(fleet.clone()));
    let ctx = DirectorContext::new(
        Store::in_memory(),
        cloud.clone(),
        fleet,
        Arc::new(InMemoryLeaseStore::new()),
        config,
    );
    (ctx, cloud)
}

/// Register every stemcell and template the manifest uses that the store
/// does not know yet
pub async fn seed_store(store: &Store, manifest: &DeploymentManifest) -> Result<()> {
    for pool in &manifest.resource_pools {
        let (name, version) = (pool.stemcell.name.clone(), pool.stemcell.version.clone());
        let known = store
            .stemcells
            .first(&|stemcell: &StemcellRecord| stemcell.name == name && stemcell.version == version)
            .await?;
        if known.is_none() {
            let cid = format!("sim-stemcell-{name}-{version}");
            debug!(stemcell = %name, %version, %cid, "Registering simulated stemcell");
            store
                .stemcells
                .create(StemcellRecord::new(name, version, cid))
                .await?;
        }
    }

    let release = &manifest.release;
    for job in &manifest.jobs {
        let template = job.template.clone();
        let known = store
            .templates
            .first(&|record: &TemplateRecord| record.release == release.name && record.name == template)
            .await?;
        if known.is_none() {
            debug!(%template, release = %release.name, "Registering simulated template");
            store
                .templates
                .create(TemplateRecord {
                    id: RecordId::default(),
                    release: release.name.clone(),
                    name: template.clone(),
                    version: release.version.clone(),
                    sha1: format!("sim-{template}"),
                    blobstore_id: format!("sim-{template}"),
                    package_names: Vec::new(),
                })
                .await?;
        }
    }
    Ok(())
}
