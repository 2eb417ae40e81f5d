//! Armada Sim - Simulated cloud and agent fleet
//!
//! Implements [`armada_infra::Cloud`] and [`armada_infra::AgentFactory`]
//! entirely in memory. Every VM the cloud creates boots a simulated agent
//! that keeps whatever state is applied to it. Faults can be injected to
//! rehearse failure handling:
//!
//! - out-of-space disk attachments
//! - jobs that never become healthy
//! - agents without the `start` call
//!
//! ## Usage
//!
//! ```
//! use armada_infra::{Cloud, VmRequest};
//! use armada_sim::{SimulatedCloud, SimulatedFleet};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let fleet = Arc::new(SimulatedFleet::new());
//! let cloud = SimulatedCloud::new(fleet.clone());
//! let request = VmRequest {
//!     agent_id: "agent-1".into(),
//!     stemcell_cid: "stemcell-1".into(),
//!     cloud_properties: serde_json::Value::Null,
//!     networks: Default::default(),
//!     disk_locality: Vec::new(),
//!     env: serde_json::Value::Null,
//! };
//! cloud.create_vm(&request).await.unwrap();
//! assert!(fleet.get("agent-1").is_some());
//! # });
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod agent;
pub mod cloud;

// Re-exports
pub use agent::{SimulatedAgent, SimulatedFleet};
pub use cloud::{CloudCall, SimulatedCloud, SimulatedDisk, SimulatedVm};
