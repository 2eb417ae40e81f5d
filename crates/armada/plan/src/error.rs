//! Plan construction and compilation errors

use armada_infra::AgentError;
use armada_network::NetworkError;
use armada_store::StoreError;
use armada_types::{DefaultProperty, TypesError};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Plan errors
#[derive(Debug, Error)]
pub enum PlanError {
    // Manifest problems
    #[error("Duplicate {kind} name `{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("`{origin}' references an unknown network `{network}'")]
    UnknownNetwork { origin: String, network: String },

    #[error("Job `{job}' references an unknown resource pool `{resource_pool}'")]
    UnknownResourcePool { job: String, resource_pool: String },

    #[error("Job `{job}' must specify at least one network")]
    MissingNetwork { job: String },

    #[error("Job `{job}' has {instances} instances but was allocated {ips} static IPs")]
    StaticIpCountMismatch { job: String, instances: u32, ips: usize },

    #[error("Job `{job}' specified more than one network to contain default {property}")]
    MultipleDefaults { job: String, property: DefaultProperty },

    #[error("Job `{job}' must specify which network is default for {missing}, since it has more than one network configured")]
    MissingDefault { job: String, missing: String },

    #[error("Job `{job}' has an invalid state `{state}'")]
    InvalidState { job: String, state: String },

    #[error("Job `{job}' has a state for instance {index} but only {instances} instances")]
    InvalidInstanceIndex { job: String, index: u32, instances: u32 },

    #[error("Update config is missing `{field}'")]
    MissingUpdateSetting { field: &'static str },

    // Capacity
    #[error("Resource pool `{resource_pool}' is not big enough: {needed} VMs needed, capacity is {size}")]
    PoolOversubscribed {
        resource_pool: String,
        needed: u32,
        size: u32,
    },

    #[error("Resource pool `{resource_pool}' has no idle VM left")]
    NoIdleVm { resource_pool: String },

    // Catalogue
    #[error("Stemcell `{name}/{version}' doesn't exist")]
    UnknownStemcell { name: String, version: String },

    #[error("Template `{template}' doesn't exist in release `{release}'")]
    UnknownTemplate { template: String, release: String },

    #[error("Package `{package}' doesn't exist in release `{release}'")]
    UnknownPackage { package: String, release: String },

    #[error("Package `{package}' has not been compiled for stemcell `{stemcell}'")]
    MissingCompiledPackage { package: String, stemcell: String },

    // Live state out of sync with the store
    #[error("VM `{vm}' is out of sync: instance `{instance}' belongs to another deployment")]
    VmInstanceOutOfSync { vm: String, instance: String },

    #[error("VM `{agent_id}' is out of sync: expected to be a part of deployment `{expected}' but is actually a part of deployment `{}'", .actual.as_deref().unwrap_or("none"))]
    AgentWrongDeployment {
        agent_id: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("VM `{agent_id}' is out of sync: it reports itself as `{job}' but there is no instance reference in DB")]
    AgentUnexpectedJob { agent_id: String, job: String },

    #[error("VM `{agent_id}' is out of sync: it reports itself as `{actual}' but according to DB it is `{expected}'")]
    AgentJobMismatch {
        agent_id: String,
        expected: String,
        actual: String,
    },

    // Binding
    #[error("`{instance}' asked for a static IP {ip} but got a dynamic one")]
    BadStaticReservation { instance: String, ip: Ipv4Addr },

    #[error("Target state for `{instance}' is undefined")]
    TargetStateUndefined { instance: String },

    #[error("`{instance}' is not bound to a VM")]
    InstanceNotBound { instance: String },

    #[error("Deployment `{0}' has not been bound")]
    DeploymentNotBound(String),

    #[error("Unknown job `{job}'")]
    UnknownJob { job: String },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for plan operations
pub type Result<T> = std::result::Result<T, PlanError>;
