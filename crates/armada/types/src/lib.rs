//! Armada Types - Shared value types for fleet orchestration
//!
//! These types cross crate boundaries: the compiler renders them, the agent
//! reports them back, and the updater compares the two to detect drift.
//!
//! ## Key Concepts
//!
//! - **ApplySpec**: The desired state pushed to an agent
//! - **AgentState**: The state an agent reports about itself
//! - **UpdateConfig**: Canary, concurrency and watch settings for a rollout
//! - **TargetState**: What an instance should be doing after the deploy

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod network;
pub mod spec;
pub mod state;
pub mod update;

// Re-export main types
pub use error::TypesError;
pub use network::{DefaultProperty, NetworkSettings, NetworkSettingsMap};
pub use spec::{
    ApplySpec, JobSpec, PackageSpec, ReleaseRef, ResourcePoolSnapshot, StemcellRef, StemcellSpec,
};
pub use state::{AgentState, TargetState, JOB_STATE_RUNNING};
pub use update::{UpdateConfig, WatchRange, MAX_IN_FLIGHT_LIMIT};
