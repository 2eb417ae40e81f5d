//! Armada Lock - Lease based distributed locks
//!
//! Deploys, deletes and release uploads must never run concurrently against
//! the same deployment or release. Every such operation holds a named lease
//! in a shared [`LeaseStore`]:
//!
//! - `deployment:<name>` for deployment mutations
//! - `release:<name>` for release mutations
//!
//! A lease is stored as `<expiry_ms>:<owner>`. The holder refreshes it in
//! the background for as long as the [`LockGuard`] lives; a crashed holder
//! loses the lock once its lease expires.
//!
//! ## Usage
//!
//! ```
//! use armada_lock::{InMemoryLeaseStore, LockManager, LockSettings};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let locks = LockManager::new(Arc::new(InMemoryLeaseStore::new()), LockSettings::default());
//! let guard = locks.deployment_lock("web").acquire().await.unwrap();
//! guard.release().await.unwrap();
//! # });
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod lock;
pub mod store;

// Re-exports
pub use error::{LockError, Result};
pub use lock::{DistributedLock, LockGuard, LockManager, LockSettings};
pub use store::{InMemoryLeaseStore, LeaseStore};
