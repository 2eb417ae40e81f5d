//! Armada Plan - Deployment plans and the plan compiler
//!
//! A [`DeploymentPlan`] is built from a [`DeploymentManifest`] and describes
//! everything one deploy attempt wants: networks, resource pools and jobs.
//! The [`DeploymentPlanCompiler`] then binds it to what is actually running:
//!
//! 1. Deployment record and stemcells
//! 2. Existing VMs, verified against their agents
//! 3. Resource pool idle VMs and their dynamic addresses
//! 4. Instance network reservations
//! 5. Templates, compiled packages and configuration hashes
//! 6. Instance records, target states and idle VM allocation
//!
//! A compiled plan hands out owned [`InstanceTarget`]s to the updater and
//! takes [`InstanceOutcome`]s back.
//!
//! ## Usage
//!
//! ```
//! use armada_plan::{DeploymentManifest, DeploymentPlan};
//!
//! let manifest = DeploymentManifest::from_json(r#"{
//!     "name": "web",
//!     "release": {"name": "appcloud", "version": "1"},
//!     "networks": [{"name": "default",
//!                   "subnets": [{"range": "10.0.0.0/24", "gateway": "10.0.0.1"}]}],
//!     "resource_pools": [{"name": "small", "size": 2, "network": "default",
//!                         "stemcell": {"name": "ubuntu", "version": "3"}}],
//!     "update": {"canaries": 1, "canary_watch_time": "1000-5000",
//!                "max_in_flight": 2, "update_watch_time": "1000-5000"},
//!     "jobs": [{"name": "nginx", "template": "nginx", "instances": 2,
//!               "resource_pool": "small", "networks": [{"name": "default"}]}]
//! }"#).unwrap();
//!
//! let plan = DeploymentPlan::from_manifest(&manifest, false).unwrap();
//! assert_eq!(plan.job("nginx").unwrap().instances.len(), 2);
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod compiler;
pub mod error;
pub mod instance;
pub mod job;
pub mod manifest;
pub mod plan;
pub mod resource_pool;

// Re-exports
pub use compiler::DeploymentPlanCompiler;
pub use error::{PlanError, Result};
pub use instance::{Change, Changes, InstanceSpec};
pub use job::{InstanceGroupSpec, UpdateErrorTracker};
pub use manifest::{
    DeploymentManifest, JobManifest, JobNetworkManifest, ResourcePoolManifest, UpdateManifest,
    DEFAULT_MAX_ERRORS,
};
pub use plan::{DeploymentPlan, InstanceOutcome, InstanceTarget, ResourcePoolTarget};
pub use resource_pool::{IdleVm, InstanceKey, ResourcePool};
