//! Armada Infra - Interfaces to the outside world
//!
//! The director never talks to a cloud or an agent directly. It goes through
//! the traits in this crate:
//!
//! - [`Cloud`]: the cloud provider interface (VMs, disks, networks)
//! - [`Agent`] / [`AgentFactory`]: RPC to the agent running on each VM
//! - [`Ticker`]: progress reporting for long running stages
//!
//! [`RetryingAgent`] decorates any agent with timeout retries on the
//! idempotent calls, and [`wait_for_task`] polls long running agent tasks.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod agent;
pub mod cloud;
pub mod error;
pub mod retry;
pub mod ticker;

// Re-exports
pub use agent::{wait_for_task, Agent, AgentFactory, AgentTask, DrainReason, TaskState};
pub use cloud::{Cloud, VmRequest};
pub use error::{AgentError, AgentResult, CloudError, CloudResult};
pub use retry::{RetryingAgent, RetryingAgentFactory};
pub use ticker::{NoopTicker, RecordingTicker, Ticker};
