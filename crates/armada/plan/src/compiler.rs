//! The plan compiler: binds a deployment plan to live infrastructure
//!
//! Compilation is a fixed sequence of phases. Each phase mutates the plan in
//! place and may read or write the store; none of them touches the cloud.
//! A failing phase aborts the compile, and records already saved stay saved.

use crate::error::{PlanError, Result};
use crate::job::InstanceGroupSpec;
use crate::plan::DeploymentPlan;
use crate::resource_pool::{IdleVm, InstanceKey};
use crate::instance::InstanceSpec;
use armada_infra::AgentFactory;
use armada_network::Reservation;
use armada_store::{
    CompiledPackageRecord, DeploymentRecord, InstanceRecord, PackageRecord, PersistentDiskRecord,
    RecordId, StemcellRecord, Store, TemplateRecord, VmRecord,
};
use armada_types::{AgentState, JobSpec, PackageSpec, TargetState};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Live reservations of one VM, keyed by network name
type LiveReservations = BTreeMap<String, Reservation>;

/// Binds a [`DeploymentPlan`] against the store and the running agents
#[derive(Clone)]
pub struct DeploymentPlanCompiler {
    store: Store,
    agents: Arc<dyn AgentFactory>,
}

impl DeploymentPlanCompiler {
    pub fn new(store: Store, agents: Arc<dyn AgentFactory>) -> Self {
        Self { store, agents }
    }

    /// Run every binding phase in order
    #[instrument(skip(self, plan), fields(deployment = %plan.name))]
    pub async fn compile(&self, plan: &mut DeploymentPlan) -> Result<()> {
        self.bind_deployment(plan).await?;
        self.bind_stemcells(plan).await?;
        self.bind_existing_deployment(plan).await?;
        self.bind_resource_pools(plan)?;
        self.bind_instance_networks(plan)?;
        self.bind_templates(plan).await?;
        self.bind_packages(plan).await?;
        self.bind_configuration(plan)?;
        self.bind_instance_records(plan).await?;
        self.bind_instance_vms(plan)?;

        info!(
            jobs = plan.jobs.len(),
            unneeded_vms = plan.unneeded_vms.len(),
            unneeded_instances = plan.unneeded_instances.len(),
            "Deployment plan compiled"
        );
        Ok(())
    }

    /// Find or create the deployment record
    pub async fn bind_deployment(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let name = plan.name.clone();
        let existing = self
            .store
            .deployments
            .first(&|deployment: &DeploymentRecord| deployment.name == name)
            .await?;
        let deployment = match existing {
            Some(deployment) => deployment,
            None => {
                info!(deployment = %name, "Creating deployment");
                self.store.deployments.create(DeploymentRecord::new(&name)).await?
            }
        };
        plan.deployment = Some(deployment);
        Ok(())
    }

    /// Resolve every pool's stemcell to its cloud id
    pub async fn bind_stemcells(&self, plan: &mut DeploymentPlan) -> Result<()> {
        for pool in plan.resource_pools.iter_mut() {
            let name = pool.stemcell().name().to_string();
            let version = pool.stemcell().version().to_string();
            let stemcell = self
                .store
                .stemcells
                .first(&|stemcell: &StemcellRecord| stemcell.name == name && stemcell.version == version)
                .await?
                .ok_or_else(|| PlanError::UnknownStemcell {
                    name: name.clone(),
                    version: version.clone(),
                })?;
            debug!(resource_pool = pool.name(), stemcell = %stemcell.cid, "Bound stemcell");
            pool.bind_stemcell(stemcell.id, &stemcell.cid);
        }
        Ok(())
    }

    /// Match every persisted VM of the deployment to the plan
    pub async fn bind_existing_deployment(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let deployment_id = plan.deployment_id()?;
        let vms = self
            .store
            .vms
            .filter(&|vm: &VmRecord| vm.deployment_id == deployment_id)
            .await?;
        if vms.is_empty() {
            return Ok(());
        }

        let states = try_join_all(vms.iter().map(|vm| async move {
            debug!(agent_id = %vm.agent_id, "Requesting current VM state");
            self.agents.agent(&vm.agent_id).get_state().await
        }))
        .await?;

        for (vm, state) in vms.into_iter().zip(states) {
            self.bind_existing_vm(plan, vm, state).await?;
        }
        Ok(())
    }

    async fn bind_existing_vm(&self, plan: &mut DeploymentPlan, vm: VmRecord, state: AgentState) -> Result<()> {
        let vm_id = vm.id;
        let instance = self
            .store
            .instances
            .first(&|instance: &InstanceRecord| instance.vm_id == Some(vm_id))
            .await?;

        verify_state(&plan.name, &vm, instance.as_ref(), &state)?;
        if let Some(instance) = &instance {
            self.migrate_legacy_disk(instance, &state).await?;
        }

        let reservations = reserve_live_addresses(plan, &state);
        match instance {
            Some(instance) => bind_instance(plan, instance, vm, state, reservations)?,
            None => bind_idle_vm(plan, vm, state, reservations)?,
        }
        Ok(())
    }

    /// Record the disk size of deployments that predate size tracking
    async fn migrate_legacy_disk(&self, instance: &InstanceRecord, state: &AgentState) -> Result<()> {
        if state.persistent_disk == 0 {
            return Ok(());
        }
        let instance_id = instance.id;
        let disk = self
            .store
            .persistent_disks
            .first(&|disk: &PersistentDiskRecord| disk.instance_id == instance_id && disk.active)
            .await?;
        if let Some(mut disk) = disk.filter(|disk| disk.size == 0) {
            debug!(instance = %instance.name(), size = state.persistent_disk, "Recording legacy disk size");
            disk.size = state.persistent_disk;
            self.store.persistent_disks.save(&disk).await?;
        }
        Ok(())
    }

    /// Fill every pool up to its size and give each idle VM an address
    ///
    /// Idle VMs beyond the pool size are marked unneeded first.
    pub fn bind_resource_pools(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let DeploymentPlan {
            networks,
            resource_pools,
            unneeded_vms,
            ..
        } = plan;

        for pool in resource_pools.iter_mut() {
            let pool_name = pool.name().to_string();
            let network_name = pool.network().to_string();
            let network = networks
                .get_mut(&network_name)
                .ok_or_else(|| PlanError::UnknownNetwork {
                    origin: pool_name.clone(),
                    network: network_name.clone(),
                })?;

            let extra = pool.extra_vm_count();
            for _ in 0..extra {
                let Some(idle) = pool.idle_vms.pop() else {
                    break;
                };
                if let Some(ip) = idle.ip {
                    network.release_ip(ip)?;
                }
                if let Some(vm) = idle.vm {
                    debug!(resource_pool = %pool_name, agent_id = %vm.agent_id, "Idle VM beyond pool size");
                    unneeded_vms.push(vm);
                }
            }

            let missing = pool.missing_vm_count();
            for _ in 0..missing {
                pool.add_idle_vm(IdleVm::new());
            }

            for (index, idle) in pool.idle_vms.iter_mut().enumerate() {
                if idle.ip.is_none() {
                    let reservation = network.reserve(Reservation::dynamic());
                    idle.ip = Some(reservation.into_ip(&format!("{pool_name}/{index}"))?);
                }
            }
            debug!(resource_pool = %pool_name, missing, extra, "Bound resource pool");
        }
        Ok(())
    }

    /// Reserve an address for every instance network still unreserved
    pub fn bind_instance_networks(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let DeploymentPlan { networks, jobs, .. } = plan;

        for job in jobs.iter_mut() {
            for instance in job.instances.iter_mut() {
                let name = instance.name();
                for net in instance.networks.values_mut() {
                    if net.is_reserved() {
                        continue;
                    }
                    let network = networks
                        .get_mut(net.name())
                        .ok_or_else(|| PlanError::UnknownNetwork {
                            origin: name.clone(),
                            network: net.name().to_string(),
                        })?;
                    let reservation = network.reserve(net.reservation());
                    let ip = reservation.into_ip(&name)?;
                    if !net.bind(&reservation) {
                        network.release(&reservation)?;
                        return Err(PlanError::BadStaticReservation { instance: name, ip });
                    }
                }
            }
        }
        Ok(())
    }

    /// Snapshot each job's template from the release catalogue
    pub async fn bind_templates(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let release = plan.release.name.clone();
        for job in plan.jobs.iter_mut() {
            let template_name = job.template.clone();
            let template = self
                .store
                .templates
                .first(&|template: &TemplateRecord| template.release == release && template.name == template_name)
                .await?
                .ok_or_else(|| PlanError::UnknownTemplate {
                    template: template_name.clone(),
                    release: release.clone(),
                })?;

            job.spec = Some(JobSpec {
                name: job.name.clone(),
                template: template.name,
                version: template.version,
                sha1: template.sha1,
                blobstore_id: template.blobstore_id,
            });
            job.template_packages = template.package_names;
        }
        Ok(())
    }

    /// Attach the compiled packages each job needs on its pool's stemcell
    pub async fn bind_packages(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let release = plan.release.name.clone();
        for job in plan.jobs.iter_mut() {
            let pool = plan
                .resource_pools
                .iter()
                .find(|pool| pool.name() == job.resource_pool)
                .ok_or_else(|| PlanError::UnknownResourcePool {
                    job: job.name.clone(),
                    resource_pool: job.resource_pool.clone(),
                })?;
            let stemcell = format!("{}/{}", pool.stemcell().name(), pool.stemcell().version());
            let stemcell_id = pool.stemcell_id().ok_or_else(|| PlanError::UnknownStemcell {
                name: pool.stemcell().name().to_string(),
                version: pool.stemcell().version().to_string(),
            })?;

            let mut packages = BTreeMap::new();
            for package_name in &job.template_packages {
                let package = self
                    .store
                    .packages
                    .first(&|package: &PackageRecord| package.release == release && &package.name == package_name)
                    .await?
                    .ok_or_else(|| PlanError::UnknownPackage {
                        package: package_name.clone(),
                        release: release.clone(),
                    })?;
                let package_id = package.id;
                let compiled = self
                    .store
                    .compiled_packages
                    .first(&|compiled: &CompiledPackageRecord| {
                        compiled.package_id == package_id && compiled.stemcell_id == stemcell_id
                    })
                    .await?
                    .ok_or_else(|| PlanError::MissingCompiledPackage {
                        package: package_name.clone(),
                        stemcell: stemcell.clone(),
                    })?;

                packages.insert(
                    package_name.clone(),
                    PackageSpec {
                        name: package_name.clone(),
                        version: format!("{}.{}", package.version, compiled.build),
                        sha1: compiled.sha1,
                        blobstore_id: compiled.blobstore_id,
                    },
                );
            }
            job.packages = packages;
        }
        Ok(())
    }

    /// Hash each instance's rendered configuration
    pub fn bind_configuration(&self, plan: &mut DeploymentPlan) -> Result<()> {
        for job in plan.jobs.iter_mut() {
            let hashes = job
                .instances
                .iter()
                .map(|instance| configuration_hash(job, instance.index()))
                .collect::<Result<Vec<_>>>()?;
            for (instance, hash) in job.instances.iter_mut().zip(hashes) {
                instance.configuration_hash = Some(hash);
            }
        }
        Ok(())
    }

    /// Find or create every instance record and resolve target states
    ///
    /// Persisted instances of the deployment that match nothing in the plan
    /// are marked unneeded.
    pub async fn bind_instance_records(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let deployment_id = plan.deployment_id()?;

        for job in plan.jobs.iter_mut() {
            let job_name = job.name.clone();
            for instance in job.instances.iter_mut() {
                if instance.record.is_none() {
                    instance.record = Some(self.find_or_create_instance(deployment_id, &job_name, instance.index()).await?);
                }
                self.bind_instance_state(instance).await?;
            }
        }

        let bound = plan.bound_instance_ids();
        let unneeded: HashSet<RecordId> = plan.unneeded_instances.iter().map(|instance| instance.id).collect();
        let leftovers = self
            .store
            .instances
            .filter(&|instance: &InstanceRecord| {
                instance.deployment_id == deployment_id
                    && !bound.contains(&instance.id)
                    && !unneeded.contains(&instance.id)
            })
            .await?;
        for instance in leftovers {
            debug!(instance = %instance.name(), "Instance no longer in the plan");
            plan.unneeded_instances.push(instance);
        }
        Ok(())
    }

    async fn find_or_create_instance(&self, deployment_id: RecordId, job: &str, index: u32) -> Result<InstanceRecord> {
        let existing = self
            .store
            .instances
            .first(&|instance: &InstanceRecord| {
                instance.deployment_id == deployment_id && instance.job == job && instance.index == index
            })
            .await?;
        if let Some(instance) = existing {
            return Ok(instance);
        }
        let mut record = InstanceRecord::new(deployment_id, job, index);
        record.state = Some(TargetState::Started);
        Ok(self.store.instances.create(record).await?)
    }

    /// Plan state wins over persisted state; one of them must exist
    async fn bind_instance_state(&self, instance: &mut InstanceSpec) -> Result<()> {
        let name = instance.name();
        let record = instance
            .record
            .as_mut()
            .ok_or_else(|| PlanError::InstanceNotBound { instance: name.clone() })?;

        let target = match instance.state_override {
            Some(state) => {
                if record.state != Some(state) {
                    record.state = Some(state);
                    self.store.instances.save(record).await?;
                }
                state
            }
            None => record
                .state
                .ok_or(PlanError::TargetStateUndefined { instance: name })?,
        };
        instance.target_state = Some(target);
        Ok(())
    }

    /// Promise an idle VM to every instance that needs one
    pub fn bind_instance_vms(&self, plan: &mut DeploymentPlan) -> Result<()> {
        let DeploymentPlan {
            networks,
            resource_pools,
            jobs,
            ..
        } = plan;

        for job in jobs.iter_mut() {
            let pool = resource_pools
                .iter_mut()
                .find(|pool| pool.name() == job.resource_pool)
                .ok_or_else(|| PlanError::UnknownResourcePool {
                    job: job.name.clone(),
                    resource_pool: job.resource_pool.clone(),
                })?;
            let pool_network = pool.network().to_string();
            let network = networks
                .get_mut(&pool_network)
                .ok_or_else(|| PlanError::UnknownNetwork {
                    origin: pool.name().to_string(),
                    network: pool_network.clone(),
                })?;

            for instance in job.instances.iter_mut() {
                if instance.is_detached() || instance.vm.is_some() {
                    continue;
                }

                let slot = pool.allocate_vm()?;
                let idle = &mut pool.allocated_vms[slot];
                let idle_ip = idle.ip.take();

                // A dynamic binding on the pool's network moves onto the idle
                // VM's address; anything else gives that address back
                match (instance.networks.get_mut(&pool_network), idle_ip) {
                    (Some(net), Some(ip)) if !net.is_static() => {
                        if let Some(previous) = net.rebind_dynamic(ip).filter(|previous| *previous != ip) {
                            network.release_ip(previous)?;
                        }
                        idle.ip = Some(ip);
                    }
                    (_, Some(ip)) => network.release_ip(ip)?,
                    (_, None) => {}
                }

                if idle.vm.is_none() {
                    // The VM will boot straight onto the instance's networks
                    idle.bound_instance = Some(InstanceKey {
                        job: job.name.clone(),
                        index: instance.index(),
                    });
                }

                debug!(instance = %instance.name(), slot, existing = idle.vm.is_some(), "Allocated idle VM");
                instance.idle_vm = Some(slot);
            }
        }
        Ok(())
    }
}

/// Check that a VM, its instance record and its agent agree
fn verify_state(
    deployment: &str,
    vm: &VmRecord,
    instance: Option<&InstanceRecord>,
    state: &AgentState,
) -> Result<()> {
    if let Some(instance) = instance {
        if instance.deployment_id != vm.deployment_id {
            return Err(PlanError::VmInstanceOutOfSync {
                vm: vm.cid.clone().unwrap_or_else(|| vm.agent_id.clone()),
                instance: instance.name(),
            });
        }
    }

    if state.deployment.as_deref() != Some(deployment) {
        return Err(PlanError::AgentWrongDeployment {
            agent_id: vm.agent_id.clone(),
            expected: deployment.to_string(),
            actual: state.deployment.clone(),
        });
    }

    let reported = state
        .job_name()
        .map(|job| format!("{job}/{}", state.index.map_or_else(|| "?".to_string(), |i| i.to_string())));

    match (instance, reported) {
        (None, Some(job)) => Err(PlanError::AgentUnexpectedJob {
            agent_id: vm.agent_id.clone(),
            job,
        }),
        (Some(instance), reported)
            if state.job_name() != Some(instance.job.as_str()) || state.index != Some(instance.index) =>
        {
            Err(PlanError::AgentJobMismatch {
                agent_id: vm.agent_id.clone(),
                expected: instance.name(),
                actual: reported.unwrap_or_else(|| "nothing".to_string()),
            })
        }
        _ => Ok(()),
    }
}

/// Reserve every address a live VM reports on a network of the plan
fn reserve_live_addresses(plan: &mut DeploymentPlan, state: &AgentState) -> LiveReservations {
    let mut reservations = LiveReservations::new();
    for (name, settings) in &state.networks {
        let Some(network) = plan.networks.get_mut(name) else {
            continue;
        };
        let reservation = network.reserve(Reservation::existing(settings.ip));
        if reservation.is_reserved() {
            reservations.insert(name.clone(), reservation);
        } else {
            debug!(network = %name, ip = %settings.ip, "Live address could not be reserved");
        }
    }
    reservations
}

fn bind_instance(
    plan: &mut DeploymentPlan,
    instance: InstanceRecord,
    vm: VmRecord,
    state: AgentState,
    reservations: LiveReservations,
) -> Result<()> {
    let bound = plan.jobs.iter_mut().find(|job| job.name == instance.job).and_then(|job| {
        let pool = job.resource_pool.clone();
        job.instance_mut(instance.index).map(|spec| (pool, spec))
    });

    let Some((pool_name, spec)) = bound else {
        debug!(instance = %instance.name(), "Instance no longer in the plan");
        plan.unneeded_instances.push(instance);
        return Ok(());
    };

    debug!(instance = %instance.name(), agent_id = %vm.agent_id, "Binding instance VM");
    spec.record = Some(instance);
    spec.vm = Some(vm);
    spec.current_state = Some(state);

    for (name, reservation) in reservations {
        let accepted = match (spec.networks.get_mut(&name), reservation.ip()) {
            (Some(net), Some(ip)) => net.use_reservation(ip, reservation.is_static()),
            _ => false,
        };
        if !accepted {
            if let Some(network) = plan.networks.get_mut(&name) {
                network.release(&reservation)?;
            }
        }
    }

    if let Some(pool) = plan.resource_pools.iter_mut().find(|pool| pool.name() == pool_name) {
        pool.mark_active();
    }
    Ok(())
}

fn bind_idle_vm(
    plan: &mut DeploymentPlan,
    vm: VmRecord,
    state: AgentState,
    reservations: LiveReservations,
) -> Result<()> {
    let pool = match &state.resource_pool {
        Some(snapshot) => plan
            .resource_pools
            .iter_mut()
            .find(|pool| pool.name() == snapshot.name),
        None => None,
    };

    let Some(pool) = pool else {
        debug!(agent_id = %vm.agent_id, "Resource pool no longer exists");
        plan.unneeded_vms.push(vm);
        return Ok(());
    };

    let mut idle = IdleVm::existing(vm, state);
    if let Some(reservation) = reservations.get(pool.network()) {
        if reservation.is_static() {
            if let Some(network) = plan.networks.get_mut(pool.network()) {
                network.release(reservation)?;
            }
        } else {
            idle.ip = reservation.ip();
        }
    }
    debug!(resource_pool = pool.name(), ip = ?idle.ip, "Adding idle VM");
    pool.add_idle_vm(idle);
    Ok(())
}

/// blake3 over the job spec, the job properties and the instance index
fn configuration_hash(job: &InstanceGroupSpec, index: u32) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(&job.spec)?);
    hasher.update(&serde_json::to_vec(&job.properties)?);
    hasher.update(&index.to_be_bytes());
    Ok(hasher.finalize().to_hex().to_string())
}
