//! Armada Director - Deploy orchestration
//!
//! The director ties the plan compiler, the deployment lock and the rollout
//! stages together:
//! - [`Deployer`] runs one deploy under the deployment's lock
//! - [`DirectorContext`] carries the store, cloud, agents and settings
//! - [`DirectorConfig`] loads settings from defaults, a file and `ARMADA_` variables
//! - [`rehearsal`] deploys against the simulated fleet
//!
//! ## Usage
//!
//! ```no_run
//! use armada_director::{rehearsal, Deployer, DirectorConfig};
//! use armada_plan::DeploymentManifest;
//!
//! # async fn example(manifest: DeploymentManifest) -> armada_director::Result<()> {
//! let (ctx, _cloud) = rehearsal::simulated_context(DirectorConfig::default());
//! rehearsal::seed_store(&ctx.store, &manifest).await?;
//! let summary = Deployer::new(ctx).deploy(&manifest, false).await?;
//! println!("{} instances updated", summary.updated_instances());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod rehearsal;

// Re-exports
pub use config::{AgentConfig, DeleterConfig, DirectorConfig, LoggingConfig, UpdateSection};
pub use context::DirectorContext;
pub use deploy::{DeploySummary, Deployer, JobSummary};
pub use error::{DirectorError, Result};
