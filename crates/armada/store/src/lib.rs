//! Armada Store - Persistence interface for director records
//!
//! The director persists a handful of record kinds: deployments, instances,
//! VMs, persistent disks, stemcells and the release catalogue (templates,
//! packages and their compiled builds). Each kind is reached through a
//! [`Repository`], and [`Store`] bundles one repository per kind.
//!
//! ## Usage
//!
//! ```
//! use armada_store::{DeploymentRecord, Repository, Store};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = Store::in_memory();
//! let record = store
//!     .deployments
//!     .create(DeploymentRecord::new("web"))
//!     .await
//!     .unwrap();
//! assert!(store.deployments.find(record.id).await.unwrap().is_some());
//! # });
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
pub mod records;
pub mod repository;

// Re-exports
pub use error::{Result, StoreError};
pub use memory::InMemoryRepository;
pub use records::{
    CompiledPackageRecord, DeploymentRecord, InstanceRecord, PackageRecord, PersistentDiskRecord,
    StemcellRecord, TemplateRecord, VmRecord,
};
pub use repository::{Record, RecordId, Repository};

use std::sync::Arc;

/// One repository per record kind
#[derive(Clone)]
pub struct Store {
    pub deployments: Arc<dyn Repository<DeploymentRecord>>,
    pub instances: Arc<dyn Repository<InstanceRecord>>,
    pub vms: Arc<dyn Repository<VmRecord>>,
    pub persistent_disks: Arc<dyn Repository<PersistentDiskRecord>>,
    pub stemcells: Arc<dyn Repository<StemcellRecord>>,
    pub templates: Arc<dyn Repository<TemplateRecord>>,
    pub packages: Arc<dyn Repository<PackageRecord>>,
    pub compiled_packages: Arc<dyn Repository<CompiledPackageRecord>>,
}

impl Store {
    /// Store backed entirely by memory, for development and tests
    pub fn in_memory() -> Self {
        Self {
            deployments: Arc::new(InMemoryRepository::new()),
            instances: Arc::new(InMemoryRepository::new()),
            vms: Arc::new(InMemoryRepository::new()),
            persistent_disks: Arc::new(InMemoryRepository::new()),
            stemcells: Arc::new(InMemoryRepository::new()),
            templates: Arc::new(InMemoryRepository::new()),
            packages: Arc::new(InMemoryRepository::new()),
            compiled_packages: Arc::new(InMemoryRepository::new()),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
