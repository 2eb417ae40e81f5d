//! Instance groups ("jobs") and their shared rollout error tracker

use crate::instance::InstanceSpec;
use armada_types::{DefaultProperty, JobSpec, PackageSpec, TargetState, UpdateConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Errors recorded while a job rolls out
///
/// Shared by every concurrent instance update of the job.
#[derive(Debug)]
pub struct UpdateErrorTracker {
    max_errors: u32,
    errors: AtomicU32,
    rollback: AtomicBool,
}

impl UpdateErrorTracker {
    pub fn new(max_errors: u32) -> Self {
        Self {
            max_errors,
            errors: AtomicU32::new(0),
            rollback: AtomicBool::new(false),
        }
    }

    /// Count a failed instance update; returns true if the job must roll back
    ///
    /// Any canary failure rolls back, as does reaching `max_errors`.
    pub fn record_update_error(&self, canary: bool) -> bool {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if canary || count >= self.max_errors {
            self.rollback.store(true, Ordering::SeqCst);
        }
        self.should_rollback()
    }

    pub fn should_rollback(&self) -> bool {
        self.rollback.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }
}

/// A named group of identical instances
#[derive(Debug, Clone)]
pub struct InstanceGroupSpec {
    pub name: String,
    pub template: String,
    /// Persistent disk size in MiB
    pub persistent_disk: u64,
    pub resource_pool: String,
    pub update: UpdateConfig,
    pub instances: Vec<InstanceSpec>,
    /// Which network provides each default property
    pub default_network: BTreeMap<DefaultProperty, String>,
    pub properties: Value,
    /// Job template snapshot, bound by the compiler
    pub spec: Option<JobSpec>,
    /// Package names the template needs, bound with the template
    pub template_packages: Vec<String>,
    /// Compiled packages, bound by the compiler
    pub packages: BTreeMap<String, PackageSpec>,
    /// Job-wide target state from the manifest
    pub state: Option<TargetState>,
    pub errors: Arc<UpdateErrorTracker>,
}

impl InstanceGroupSpec {
    /// Defaults carried by `network`, or `None` if it carries none
    pub fn default_properties(&self, network: &str) -> Option<Vec<DefaultProperty>> {
        let props: Vec<DefaultProperty> = self
            .default_network
            .iter()
            .filter(|(_, name)| name.as_str() == network)
            .map(|(prop, _)| *prop)
            .collect();
        (!props.is_empty()).then_some(props)
    }

    pub fn instance(&self, index: u32) -> Option<&InstanceSpec> {
        self.instances.get(index as usize)
    }

    pub fn instance_mut(&mut self, index: u32) -> Option<&mut InstanceSpec> {
        self.instances.get_mut(index as usize)
    }

    pub fn should_rollback(&self) -> bool {
        self.errors.should_rollback()
    }

    /// Start a fresh error count for a new rollout
    pub fn reset_errors(&mut self) {
        self.errors = Arc::new(UpdateErrorTracker::new(self.update.max_errors));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_failure_always_rolls_back() {
        let tracker = UpdateErrorTracker::new(10);
        assert!(tracker.record_update_error(true));
        assert!(tracker.should_rollback());
    }

    #[test]
    fn test_batch_failures_roll_back_at_threshold() {
        let tracker = UpdateErrorTracker::new(3);
        assert!(!tracker.record_update_error(false));
        assert!(!tracker.record_update_error(false));
        assert!(tracker.record_update_error(false));
        assert_eq!(tracker.error_count(), 3);
    }
}
