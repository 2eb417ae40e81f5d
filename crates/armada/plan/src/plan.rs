//! The deployment plan: desired state bound to live infrastructure

use crate::error::{PlanError, Result};
use crate::instance::{Change, Changes, InstanceSpec};
use crate::job::{InstanceGroupSpec, UpdateErrorTracker};
use crate::manifest::{DeploymentManifest, JobManifest};
use crate::resource_pool::{IdleVm, ResourcePool};
use armada_network::{InstanceNetwork, Network};
use armada_store::{DeploymentRecord, InstanceRecord, RecordId, VmRecord};
use armada_types::{
    AgentState, ApplySpec, DefaultProperty, NetworkSettingsMap, ReleaseRef, ResourcePoolSnapshot,
    TargetState, UpdateConfig,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Everything one deploy attempt wants, plus what the compiler bound to it
///
/// Built once per deploy attempt and discarded afterwards.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub name: String,
    pub release: ReleaseRef,
    pub properties: Value,
    pub networks: BTreeMap<String, Network>,
    pub resource_pools: Vec<ResourcePool>,
    pub update: UpdateConfig,
    pub jobs: Vec<InstanceGroupSpec>,
    /// Recreate every VM regardless of drift
    pub recreate: bool,
    /// Manifest the plan was built from, saved on success
    pub manifest: Value,
    pub deployment: Option<DeploymentRecord>,
    pub unneeded_vms: Vec<VmRecord>,
    pub unneeded_instances: Vec<InstanceRecord>,
}

/// Manifest state keyword resolved into a target state and modifiers
struct ParsedState {
    state: TargetState,
    recreate: bool,
    restart: bool,
}

fn parse_state(job: &str, state: &str) -> Result<ParsedState> {
    let parsed = match state {
        "recreate" => ParsedState {
            state: TargetState::Started,
            recreate: true,
            restart: false,
        },
        "restart" => ParsedState {
            state: TargetState::Started,
            recreate: false,
            restart: true,
        },
        other => ParsedState {
            state: other.parse().map_err(|_| PlanError::InvalidState {
                job: job.to_string(),
                state: other.to_string(),
            })?,
            recreate: false,
            restart: false,
        },
    };
    Ok(parsed)
}

impl DeploymentPlan {
    /// Build a plan, checking every cross reference in the manifest
    pub fn from_manifest(manifest: &DeploymentManifest, recreate: bool) -> Result<Self> {
        let mut networks = BTreeMap::new();
        for spec in &manifest.networks {
            if networks.contains_key(&spec.name) {
                return Err(PlanError::DuplicateName {
                    kind: "network",
                    name: spec.name.clone(),
                });
            }
            networks.insert(spec.name.clone(), Network::from_spec(spec)?);
        }

        let mut resource_pools: Vec<ResourcePool> = Vec::new();
        for spec in &manifest.resource_pools {
            if resource_pools.iter().any(|pool| pool.name() == spec.name) {
                return Err(PlanError::DuplicateName {
                    kind: "resource pool",
                    name: spec.name.clone(),
                });
            }
            if !networks.contains_key(&spec.network) {
                return Err(PlanError::UnknownNetwork {
                    origin: spec.name.clone(),
                    network: spec.network.clone(),
                });
            }
            resource_pools.push(ResourcePool::new(spec));
        }

        let update = manifest.update.resolve(None)?;

        let mut jobs: Vec<InstanceGroupSpec> = Vec::new();
        for spec in &manifest.jobs {
            if jobs.iter().any(|job| job.name == spec.name) {
                return Err(PlanError::DuplicateName {
                    kind: "job",
                    name: spec.name.clone(),
                });
            }
            let pool = resource_pools
                .iter_mut()
                .find(|pool| pool.name() == spec.resource_pool)
                .ok_or_else(|| PlanError::UnknownResourcePool {
                    job: spec.name.clone(),
                    resource_pool: spec.resource_pool.clone(),
                })?;
            pool.reserve_capacity(spec.instances)?;

            jobs.push(Self::build_job(spec, manifest, &networks, &update)?);
        }

        Ok(Self {
            name: manifest.name.clone(),
            release: manifest.release.clone(),
            properties: manifest.properties.clone(),
            networks,
            resource_pools,
            update,
            jobs,
            recreate,
            manifest: serde_json::to_value(manifest)?,
            deployment: None,
            unneeded_vms: Vec::new(),
            unneeded_instances: Vec::new(),
        })
    }

    fn build_job(
        spec: &JobManifest,
        manifest: &DeploymentManifest,
        networks: &BTreeMap<String, Network>,
        deployment_update: &UpdateConfig,
    ) -> Result<InstanceGroupSpec> {
        let update = match &spec.update {
            Some(update) => update.resolve(Some(deployment_update))?,
            None => deployment_update.clone(),
        };

        let job_state = spec
            .state
            .as_deref()
            .map(|state| parse_state(&spec.name, state))
            .transpose()?;

        let mut instances: Vec<InstanceSpec> = (0..spec.instances)
            .map(|index| {
                let mut instance = InstanceSpec::new(&spec.name, index);
                if let Some(parsed) = &job_state {
                    instance.state_override = Some(parsed.state);
                    instance.recreate = parsed.recreate;
                    instance.restart = parsed.restart;
                }
                instance
            })
            .collect();

        for (&index, state) in &spec.instance_states {
            let parsed = parse_state(&spec.name, state)?;
            let instance = instances.get_mut(index as usize).ok_or_else(|| {
                PlanError::InvalidInstanceIndex {
                    job: spec.name.clone(),
                    index,
                    instances: spec.instances,
                }
            })?;
            instance.state_override = Some(parsed.state);
            instance.recreate = parsed.recreate;
            instance.restart = parsed.restart;
        }

        if spec.networks.is_empty() {
            return Err(PlanError::MissingNetwork {
                job: spec.name.clone(),
            });
        }

        let mut default_network = BTreeMap::new();
        for net in &spec.networks {
            if !networks.contains_key(&net.name) {
                return Err(PlanError::UnknownNetwork {
                    origin: spec.name.clone(),
                    network: net.name.clone(),
                });
            }

            let static_ips: Vec<_> = net.static_ips.iter().flat_map(|span| span.iter()).collect();
            if !static_ips.is_empty() && static_ips.len() != spec.instances as usize {
                return Err(PlanError::StaticIpCountMismatch {
                    job: spec.name.clone(),
                    instances: spec.instances,
                    ips: static_ips.len(),
                });
            }

            for property in &net.default {
                if default_network.insert(*property, net.name.clone()).is_some() {
                    return Err(PlanError::MultipleDefaults {
                        job: spec.name.clone(),
                        property: *property,
                    });
                }
            }

            for (index, instance) in instances.iter_mut().enumerate() {
                let network = match static_ips.get(index) {
                    Some(ip) => InstanceNetwork::with_static_ip(&net.name, *ip),
                    None => InstanceNetwork::dynamic(&net.name),
                };
                instance.add_network(network);
            }
        }

        if spec.networks.len() > 1 {
            let missing: Vec<String> = DefaultProperty::ALL
                .iter()
                .filter(|prop| !default_network.contains_key(*prop))
                .map(ToString::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(PlanError::MissingDefault {
                    job: spec.name.clone(),
                    missing: missing.join(", "),
                });
            }
        } else {
            for property in DefaultProperty::ALL {
                default_network.insert(property, spec.networks[0].name.clone());
            }
        }

        Ok(InstanceGroupSpec {
            name: spec.name.clone(),
            template: spec.template.clone(),
            persistent_disk: spec.persistent_disk,
            resource_pool: spec.resource_pool.clone(),
            errors: Arc::new(UpdateErrorTracker::new(update.max_errors)),
            update,
            instances,
            default_network,
            properties: spec
                .properties
                .clone()
                .unwrap_or_else(|| manifest.properties.clone()),
            spec: None,
            template_packages: Vec::new(),
            packages: BTreeMap::new(),
            state: job_state.map(|parsed| parsed.state),
        })
    }

    pub fn deployment_id(&self) -> Result<RecordId> {
        self.deployment
            .as_ref()
            .map(|record| record.id)
            .ok_or_else(|| PlanError::DeploymentNotBound(self.name.clone()))
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn resource_pool(&self, name: &str) -> Option<&ResourcePool> {
        self.resource_pools.iter().find(|pool| pool.name() == name)
    }

    pub fn resource_pool_mut(&mut self, name: &str) -> Option<&mut ResourcePool> {
        self.resource_pools.iter_mut().find(|pool| pool.name() == name)
    }

    pub fn job(&self, name: &str) -> Option<&InstanceGroupSpec> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut InstanceGroupSpec> {
        self.jobs.iter_mut().find(|job| job.name == name)
    }

    fn job_and_instance(&self, job: &str, index: u32) -> Result<(&InstanceGroupSpec, &InstanceSpec)> {
        let group = self.job(job).ok_or_else(|| PlanError::UnknownJob {
            job: job.to_string(),
        })?;
        let instance = group.instance(index).ok_or_else(|| PlanError::UnknownJob {
            job: format!("{job}/{index}"),
        })?;
        Ok((group, instance))
    }

    fn pool_for(&self, job: &InstanceGroupSpec) -> Result<&ResourcePool> {
        self.resource_pool(&job.resource_pool)
            .ok_or_else(|| PlanError::UnknownResourcePool {
                job: job.name.clone(),
                resource_pool: job.resource_pool.clone(),
            })
    }

    /// Settings of every network an instance is bound on
    pub fn instance_network_settings(&self, job: &InstanceGroupSpec, instance: &InstanceSpec) -> NetworkSettingsMap {
        instance
            .networks
            .values()
            .filter_map(|net| {
                let ip = net.ip()?;
                let network = self.network(net.name())?;
                let defaults = job.default_properties(net.name());
                let settings = network.network_settings(ip, defaults.as_deref())?;
                Some((net.name().to_string(), settings))
            })
            .collect()
    }

    /// Settings an idle VM boots with
    ///
    /// A VM promised to an instance boots straight onto the instance's
    /// networks.
    pub fn idle_vm_network_settings(&self, pool: &ResourcePool, vm: &IdleVm) -> NetworkSettingsMap {
        if let Some(key) = &vm.bound_instance {
            if let Ok((job, instance)) = self.job_and_instance(&key.job, key.index) {
                return self.instance_network_settings(job, instance);
            }
        }

        let mut settings = NetworkSettingsMap::new();
        if let Some(ip) = vm.ip {
            if let Some(network) = self.network(pool.network()) {
                let defaults = Some(&DefaultProperty::ALL[..]);
                if let Some(rendered) = network.network_settings(ip, defaults) {
                    settings.insert(pool.network().to_string(), rendered);
                }
            }
        }
        settings
    }

    /// Full desired state of one instance
    pub fn apply_spec(&self, job: &InstanceGroupSpec, instance: &InstanceSpec) -> Result<ApplySpec> {
        let pool = self.pool_for(job)?;
        Ok(ApplySpec {
            deployment: self.name.clone(),
            release: Some(self.release.clone()),
            job: job.spec.clone(),
            index: Some(instance.index()),
            networks: self.instance_network_settings(job, instance),
            resource_pool: Some(pool.spec()),
            packages: job.packages.clone(),
            persistent_disk: job.persistent_disk,
            configuration_hash: instance.configuration_hash.clone(),
            properties: job.properties.clone(),
        })
    }

    /// Drift between the instance's desired and current state
    pub fn changes(&self, job: &InstanceGroupSpec, instance: &InstanceSpec) -> Result<Changes> {
        let mut changes = Changes::new();
        let target = instance.target_state;

        let empty = AgentState::default();
        let state = match &instance.current_state {
            Some(state) => state,
            None if target == Some(TargetState::Detached) => return Ok(changes),
            None => &empty,
        };

        if instance.restart {
            changes.insert(Change::Restart);
        }
        let pool = self.pool_for(job)?;
        if self.recreate || instance.recreate || state.resource_pool.as_ref() != Some(&pool.spec()) {
            changes.insert(Change::ResourcePool);
        }
        if state.networks != self.instance_network_settings(job, instance) {
            changes.insert(Change::Network);
        }
        if state.packages != job.packages {
            changes.insert(Change::Packages);
        }
        if state.persistent_disk != job.persistent_disk {
            changes.insert(Change::PersistentDisk);
        }
        if state.configuration_hash != instance.configuration_hash {
            changes.insert(Change::Configuration);
        }
        if state.job != job.spec {
            changes.insert(Change::Job);
        }
        let state_changed = match target {
            Some(TargetState::Started) => !state.is_running(),
            Some(TargetState::Stopped) => state.is_running(),
            Some(TargetState::Detached) => true,
            None => false,
        };
        if state_changed {
            changes.insert(Change::State);
        }

        Ok(changes)
    }

    /// Owned snapshot of everything an instance update needs
    pub fn instance_target(&self, job_name: &str, index: u32) -> Result<InstanceTarget> {
        let (job, instance) = self.job_and_instance(job_name, index)?;
        let pool = self.pool_for(job)?;

        let instance_record = instance.record.clone().ok_or_else(|| PlanError::InstanceNotBound {
            instance: instance.name(),
        })?;
        let vm = instance.vm.clone().ok_or_else(|| PlanError::InstanceNotBound {
            instance: instance.name(),
        })?;
        let target_state = instance.target_state.ok_or_else(|| PlanError::TargetStateUndefined {
            instance: instance.name(),
        })?;
        let stemcell_cid = pool
            .stemcell()
            .cid()
            .ok_or_else(|| PlanError::UnknownStemcell {
                name: pool.stemcell().name().to_string(),
                version: pool.stemcell().version().to_string(),
            })?
            .to_string();

        Ok(InstanceTarget {
            job: job.name.clone(),
            index,
            deployment: self.name.clone(),
            deployment_id: self.deployment_id()?,
            target_state,
            changes: self.changes(job, instance)?,
            apply_spec: self.apply_spec(job, instance)?,
            network_settings: self.instance_network_settings(job, instance),
            resource_pool: ResourcePoolTarget {
                name: pool.name().to_string(),
                snapshot: pool.spec(),
                stemcell_cid,
                cloud_properties: pool.cloud_properties().clone(),
                env: pool.env().clone(),
            },
            persistent_disk: job.persistent_disk,
            update: job.update.clone(),
            instance: instance_record,
            vm,
            current_state: instance.current_state.clone().unwrap_or_default(),
        })
    }

    /// Indices of the job's instances that need an update, in index order
    pub fn changed_instances(&self, job: &InstanceGroupSpec) -> Result<Vec<u32>> {
        let mut changed = Vec::new();
        for instance in &job.instances {
            if !self.changes(job, instance)?.is_empty() {
                changed.push(instance.index());
            }
        }
        Ok(changed)
    }

    /// Write the result of an instance update back into the plan
    pub fn apply_outcome(&mut self, outcome: InstanceOutcome) -> Result<()> {
        let job = self.job_mut(&outcome.job).ok_or_else(|| PlanError::UnknownJob {
            job: outcome.job.clone(),
        })?;
        let pool_name = job.resource_pool.clone();
        let instance = job.instance_mut(outcome.index).ok_or_else(|| PlanError::UnknownJob {
            job: format!("{}/{}", outcome.job, outcome.index),
        })?;

        instance.record = Some(outcome.instance);
        instance.vm = outcome.vm;
        instance.current_state = outcome.current_state;

        if outcome.detached {
            debug!(instance = %instance.name(), "Returning slot of detached instance");
            instance.vm = None;
            instance.idle_vm = None;
            if let Some(pool) = self.resource_pool_mut(&pool_name) {
                pool.add_idle_vm(IdleVm::new());
            }
        }
        Ok(())
    }

    /// Instance records bound to some instance of the plan
    pub(crate) fn bound_instance_ids(&self) -> HashSet<RecordId> {
        self.jobs
            .iter()
            .flat_map(|job| job.instances.iter())
            .filter_map(|instance| instance.record.as_ref().map(|record| record.id))
            .collect()
    }
}

/// Resource pool settings an instance update needs to (re)create its VM
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePoolTarget {
    pub name: String,
    pub snapshot: ResourcePoolSnapshot,
    pub stemcell_cid: String,
    pub cloud_properties: Value,
    pub env: Value,
}

/// Owned, self-contained description of one instance update
#[derive(Debug, Clone)]
pub struct InstanceTarget {
    pub job: String,
    pub index: u32,
    pub deployment: String,
    pub deployment_id: RecordId,
    pub target_state: TargetState,
    pub changes: Changes,
    pub apply_spec: ApplySpec,
    pub network_settings: NetworkSettingsMap,
    pub resource_pool: ResourcePoolTarget,
    /// Desired persistent disk size in MiB
    pub persistent_disk: u64,
    pub update: UpdateConfig,
    pub instance: InstanceRecord,
    pub vm: VmRecord,
    pub current_state: AgentState,
}

impl InstanceTarget {
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }

    pub fn has_change(&self, change: Change) -> bool {
        self.changes.contains(&change)
    }
}

/// What an instance update left behind
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub job: String,
    pub index: u32,
    pub instance: InstanceRecord,
    pub vm: Option<VmRecord>,
    pub current_state: Option<AgentState>,
    pub detached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DeploymentManifest;
    use serde_json::json;

    fn manifest(jobs: Value) -> DeploymentManifest {
        serde_json::from_value(json!({
            "name": "web",
            "release": {"name": "appcloud", "version": "1"},
            "networks": [
                {"name": "a", "subnets": [{"range": "10.0.0.0/24", "gateway": "10.0.0.1",
                                           "static": ["10.0.0.100 - 10.0.0.110"]}]},
                {"name": "b", "subnets": [{"range": "10.1.0.0/24", "gateway": "10.1.0.1"}]}
            ],
            "resource_pools": [{"name": "small", "size": 3, "network": "a",
                                "stemcell": {"name": "ubuntu", "version": "3"}}],
            "update": {"canaries": 1, "canary_watch_time": "1000-5000", "max_in_flight": 2,
                       "update_watch_time": "1000-5000"},
            "jobs": jobs
        }))
        .unwrap()
    }

    #[test]
    fn test_single_network_gets_all_defaults() {
        let plan = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 2,
                              "resource_pool": "small", "networks": [{"name": "a"}]}])),
            false,
        )
        .unwrap();

        let job = plan.job("nginx").unwrap();
        assert_eq!(job.instances.len(), 2);
        assert_eq!(
            job.default_properties("a"),
            Some(vec![DefaultProperty::Dns, DefaultProperty::Gateway])
        );
        assert_eq!(plan.resource_pool("small").unwrap().reserved(), 2);
    }

    #[test]
    fn test_multiple_networks_need_explicit_defaults() {
        let err = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 1,
                              "resource_pool": "small",
                              "networks": [{"name": "a", "default": ["dns"]}, {"name": "b"}]}])),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::MissingDefault { ref missing, .. } if missing == "gateway"));

        let err = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 1,
                              "resource_pool": "small",
                              "networks": [{"name": "a", "default": ["dns", "gateway"]},
                                           {"name": "b", "default": ["dns"]}]}])),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::MultipleDefaults { property: DefaultProperty::Dns, .. }));
    }

    #[test]
    fn test_static_ip_count_must_match_instances() {
        let err = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 2,
                              "resource_pool": "small",
                              "networks": [{"name": "a", "static_ips": ["10.0.0.100"]}]}])),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::StaticIpCountMismatch { instances: 2, ips: 1, .. }));
    }

    #[test]
    fn test_unknown_references_and_oversubscription() {
        let err = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 1,
                              "resource_pool": "large", "networks": [{"name": "a"}]}])),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownResourcePool { .. }));

        let err = DeploymentPlan::from_manifest(
            &manifest(json!([
                {"name": "nginx", "template": "nginx", "instances": 2,
                 "resource_pool": "small", "networks": [{"name": "a"}]},
                {"name": "redis", "template": "redis", "instances": 2,
                 "resource_pool": "small", "networks": [{"name": "a"}]}
            ])),
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PlanError::PoolOversubscribed { needed: 4, size: 3, .. }
        ));
    }

    #[test]
    fn test_state_overrides() {
        let plan = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 3,
                              "resource_pool": "small", "networks": [{"name": "a"}],
                              "state": "stopped",
                              "instance_states": {"1": "recreate", "2": "restart"}}])),
            false,
        )
        .unwrap();

        let job = plan.job("nginx").unwrap();
        assert_eq!(job.instances[0].state_override, Some(TargetState::Stopped));
        assert_eq!(job.instances[1].state_override, Some(TargetState::Started));
        assert!(job.instances[1].recreate);
        assert!(job.instances[2].restart);

        let err = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 1,
                              "resource_pool": "small", "networks": [{"name": "a"}],
                              "instance_states": {"4": "stopped"}}])),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidInstanceIndex { index: 4, .. }));
    }

    #[test]
    fn test_detached_instance_without_state_has_no_changes() {
        let mut plan = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 1,
                              "resource_pool": "small", "networks": [{"name": "a"}]}])),
            false,
        )
        .unwrap();
        plan.jobs[0].instances[0].target_state = Some(TargetState::Detached);

        let job = &plan.jobs[0];
        assert!(plan.changes(job, &job.instances[0]).unwrap().is_empty());
    }

    #[test]
    fn test_changes_detect_state_and_pool_drift() {
        let mut plan = DeploymentPlan::from_manifest(
            &manifest(json!([{"name": "nginx", "template": "nginx", "instances": 1,
                              "resource_pool": "small", "networks": [{"name": "a"}]}])),
            false,
        )
        .unwrap();
        plan.jobs[0].instances[0].target_state = Some(TargetState::Started);

        let job = &plan.jobs[0];
        let instance = &job.instances[0];
        let mut state = AgentState::from_apply_spec(&plan.apply_spec(job, instance).unwrap(), None);
        let mut bound = instance.clone();
        bound.current_state = Some(state.clone());

        let changes = plan.changes(job, &bound).unwrap();
        assert_eq!(changes.into_iter().collect::<Vec<_>>(), vec![Change::State]);

        state.job_state = Some("running".into());
        state.resource_pool = None;
        bound.current_state = Some(state);
        let changes = plan.changes(job, &bound).unwrap();
        assert_eq!(changes.into_iter().collect::<Vec<_>>(), vec![Change::ResourcePool]);
    }
}
