//! Armada Update - Rolling updates of a compiled deployment plan
//!
//! Once a plan is compiled, the director drives it to its target through a
//! fixed sequence of stages:
//!
//! 1. [`InstanceDeleter`] removes VMs and instances the plan no longer needs
//! 2. [`ResourcePoolUpdater`] creates missing idle VMs and recreates drifted ones
//! 3. [`InstanceVmBinder`] hands allocated idle VMs over to their instances
//! 4. [`JobUpdater`] rolls each job out, canaries first
//!
//! Every stage fans its work out over a [`BoundedWorkerPool`]; the first
//! failure stops queued work and is reported once everything in flight has
//! settled.
//!
//! ## Usage
//!
//! ```no_run
//! use armada_update::{InstanceUpdater, JobUpdater, UpdateContext};
//! use armada_plan::DeploymentPlan;
//! use std::sync::Arc;
//!
//! # async fn example(ctx: UpdateContext, plan: &mut DeploymentPlan) -> armada_update::Result<()> {
//! let jobs = JobUpdater::new(Arc::new(InstanceUpdater::new(ctx)));
//! for name in plan.jobs.iter().map(|job| job.name.clone()).collect::<Vec<_>>() {
//!     jobs.update(plan, &name).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod binder;
pub mod context;
pub mod deleter;
pub mod error;
pub mod instance_updater;
pub mod job_updater;
pub mod pool;
pub mod resource_pool_updater;
pub mod watch;

// Re-exports
pub use binder::InstanceVmBinder;
pub use context::{UpdateContext, UpdateSettings, MAX_ATTACH_DISK_TRIES};
pub use deleter::InstanceDeleter;
pub use error::{Result, UpdateError};
pub use instance_updater::{InstanceUpdate, InstanceUpdater, UPDATE_STEPS};
pub use job_updater::JobUpdater;
pub use pool::{BoundedWorkerPool, DEFAULT_MAX_TASKS};
pub use resource_pool_updater::ResourcePoolUpdater;
pub use watch::{watch_schedule, WATCH_INTERVALS};
