//! Lease acquisition, refresh and release

use crate::error::{LockError, Result};
use crate::store::LeaseStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lock timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// How long `acquire` keeps trying
    pub timeout_ms: u64,
    /// How long a lease lives without a refresh
    pub lease_ms: u64,
    /// Delay between acquisition attempts
    pub retry_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            lease_ms: 10_000,
            retry_interval_ms: 500,
        }
    }
}

impl LockSettings {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Refresh at half the lease, never more often than once a second
    fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lease_ms / 2).max(Duration::from_secs(1))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lease_value(expiry_ms: i64, owner: &str) -> String {
    format!("{expiry_ms}:{owner}")
}

fn parse_lease(value: &str) -> Option<(i64, &str)> {
    let (expiry, owner) = value.split_once(':')?;
    Some((expiry.parse().ok()?, owner))
}

/// Hands out named locks over one lease store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    pub fn lock(&self, name: impl Into<String>) -> DistributedLock {
        DistributedLock::new(self.store.clone(), name, self.settings)
    }

    pub fn deployment_lock(&self, deployment: &str) -> DistributedLock {
        self.lock(format!("deployment:{deployment}"))
    }

    pub fn release_lock(&self, release: &str) -> DistributedLock {
        self.lock(format!("release:{release}"))
    }

    /// Run `f` while holding the locks of every named release
    ///
    /// Locks are taken in lexicographic order so two callers with
    /// overlapping release sets cannot deadlock, and dropped in reverse
    /// order on every exit path.
    pub async fn with_release_locks<T, E, F, Fut>(
        &self,
        releases: &[String],
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<LockError>,
    {
        let mut names: Vec<&String> = releases.iter().collect();
        names.sort();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            match self.release_lock(name).acquire().await {
                Ok(guard) => guards.push(guard),
                Err(error) => {
                    release_all(guards).await;
                    return Err(error.into());
                }
            }
        }

        let outcome = f().await;
        release_all(guards).await;
        outcome
    }
}

async fn release_all(guards: Vec<LockGuard>) {
    for guard in guards.into_iter().rev() {
        let name = guard.name().to_string();
        if let Err(error) = guard.release().await {
            warn!(lock = %name, %error, "Failed to release lock");
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// A named lock that has not been acquired yet
pub struct DistributedLock {
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: String,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LeaseStore>, name: impl Into<String>, settings: LockSettings) -> Self {
        Self {
            store,
            name: name.into(),
            owner: Uuid::new_v4().to_string(),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lease, retrying until the configured timeout
    ///
    /// An expired lease left behind by another owner is taken over.
    #[instrument(skip(self), fields(lock = %self.name))]
    pub async fn acquire(self) -> Result<LockGuard> {
        let deadline = Instant::now() + self.settings.timeout();
        let lease_ms = self.settings.lease_ms as i64;

        loop {
            let value = lease_value(now_ms() + lease_ms, &self.owner);
            if self.store.create(&self.name, &value).await? {
                break;
            }

            if let Some(current) = self.store.get(&self.name).await? {
                let expired = parse_lease(&current).map_or(true, |(expiry, _)| expiry <= now_ms());
                if expired && self.store.compare_and_swap(&self.name, &current, &value).await? {
                    debug!(previous = %current, "Took over expired lease");
                    break;
                }
            }

            if Instant::now() >= deadline {
                return Err(LockError::LockTimeout { name: self.name });
            }
            tokio::time::sleep(self.settings.retry_interval()).await;
        }

        info!(owner = %self.owner, "Acquired lock");
        let refresher = tokio::spawn(refresh_lease(
            self.store.clone(),
            self.name.clone(),
            self.owner.clone(),
            self.settings,
        ));

        Ok(LockGuard {
            store: self.store,
            name: self.name,
            owner: self.owner,
            refresher: Some(refresher),
            released: false,
        })
    }
}

/// Keep extending the lease until someone else owns it
async fn refresh_lease(store: Arc<dyn LeaseStore>, name: String, owner: String, settings: LockSettings) {
    let lease_ms = settings.lease_ms as i64;
    loop {
        tokio::time::sleep(settings.refresh_interval()).await;

        let current = match store.get(&name).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(lock = %name, "Lease vanished, no longer refreshing");
                return;
            }
            Err(error) => {
                warn!(lock = %name, %error, "Failed to read lease");
                continue;
            }
        };

        if parse_lease(&current).map(|(_, holder)| holder) != Some(owner.as_str()) {
            warn!(lock = %name, holder = %current, "Lost lease, no longer refreshing");
            return;
        }

        let renewed = lease_value(now_ms() + lease_ms, &owner);
        match store.compare_and_swap(&name, &current, &renewed).await {
            Ok(true) => debug!(lock = %name, "Renewed lease"),
            Ok(false) => {
                warn!(lock = %name, "Lease changed while renewing");
                return;
            }
            Err(error) => warn!(lock = %name, %error, "Failed to renew lease"),
        }
    }
}

/// Delete the lease if it is still ours and still live
async fn release_lease(store: &dyn LeaseStore, name: &str, owner: &str) -> Result<()> {
    let Some(current) = store.get(name).await? else {
        return Ok(());
    };
    match parse_lease(&current) {
        Some((expiry, holder)) if holder == owner && expiry > now_ms() => {
            store.compare_and_delete(name, &current).await?;
            info!(lock = %name, "Released lock");
        }
        _ => debug!(lock = %name, "Lease no longer held, nothing to release"),
    }
    Ok(())
}

/// A held lock; the lease is refreshed until the guard is released or dropped
pub struct LockGuard {
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: String,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        release_lease(self.store.as_ref(), &self.name, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        if self.released {
            return;
        }

        // Best effort: without a runtime the lease simply expires
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let name = self.name.clone();
            let owner = self.owner.clone();
            handle.spawn(async move {
                if let Err(error) = release_lease(store.as_ref(), &name, &owner).await {
                    warn!(lock = %name, %error, "Failed to release lock on drop");
                }
            });
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;
    use std::sync::Mutex;

    fn settings(timeout_ms: u64) -> LockSettings {
        LockSettings {
            timeout_ms,
            lease_ms: 2_000,
            retry_interval_ms: 20,
        }
    }

    fn manager(timeout_ms: u64) -> LockManager {
        LockManager::new(Arc::new(InMemoryLeaseStore::new()), settings(timeout_ms))
    }

    #[test]
    fn test_lease_value_format() {
        let value = lease_value(1_700_000_000_000, "owner-1");
        assert_eq!(value, "1700000000000:owner-1");
        assert_eq!(parse_lease(&value), Some((1_700_000_000_000, "owner-1")));
        assert_eq!(parse_lease("garbage"), None);
    }

    #[test]
    fn test_refresh_interval_has_floor() {
        let short = LockSettings {
            lease_ms: 500,
            ..LockSettings::default()
        };
        assert_eq!(short.refresh_interval(), Duration::from_secs(1));

        let long = LockSettings {
            lease_ms: 30_000,
            ..LockSettings::default()
        };
        assert_eq!(long.refresh_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let locks = manager(200);
        let first = locks.deployment_lock("web").acquire().await.unwrap();

        let second = locks.deployment_lock("web").acquire().await;
        assert_eq!(
            second.unwrap_err(),
            LockError::LockTimeout {
                name: "deployment:web".into()
            }
        );

        first.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutual_exclusion_until_release() {
        let locks = manager(5_000);
        let first = locks.deployment_lock("web").acquire().await.unwrap();

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.deployment_lock("web").acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!contender.is_finished());

        first.release().await.unwrap();
        let second = contender.await.unwrap().unwrap();
        assert_eq!(second.name(), "deployment:web");
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store
            .create("deployment:web", &lease_value(now_ms() - 1, "crashed"))
            .await
            .unwrap();

        let locks = LockManager::new(store.clone(), settings(200));
        let guard = locks.deployment_lock("web").acquire().await.unwrap();

        let current = store.get("deployment:web").await.unwrap().unwrap();
        assert_eq!(parse_lease(&current).map(|(_, owner)| owner), Some(guard.owner()));
        guard.release().await.unwrap();
        assert!(store.get("deployment:web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lease_alone() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let locks = LockManager::new(store.clone(), settings(200));
        let guard = locks.deployment_lock("web").acquire().await.unwrap();

        let foreign = lease_value(now_ms() + 60_000, "someone-else");
        let current = store.get("deployment:web").await.unwrap().unwrap();
        store
            .compare_and_swap("deployment:web", &current, &foreign)
            .await
            .unwrap();

        guard.release().await.unwrap();
        assert_eq!(
            store.get("deployment:web").await.unwrap().as_deref(),
            Some(foreign.as_str())
        );
    }

    #[tokio::test]
    async fn test_release_locks_taken_in_order_and_released() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let locks = LockManager::new(store.clone(), settings(200));
        let seen = Mutex::new(Vec::new());

        let names = vec!["zookeeper".to_string(), "appcloud".to_string()];
        let (store_ref, seen_ref) = (&store, &seen);
        let result = locks
            .with_release_locks(&names, move || async move {
                for name in ["release:appcloud", "release:zookeeper"] {
                    if store_ref.get(name).await?.is_some() {
                        seen_ref.lock().unwrap().push(name);
                    }
                }
                Ok::<u32, LockError>(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(store.get("release:appcloud").await.unwrap().is_none());
        assert!(store.get("release:zookeeper").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_locks_fail_without_running_body() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let locks = LockManager::new(store.clone(), settings(100));
        let held = locks.release_lock("zookeeper").acquire().await.unwrap();

        let names = vec!["appcloud".to_string(), "zookeeper".to_string()];
        let result = locks
            .with_release_locks(&names, || async {
                Err::<(), LockError>(LockError::Store("body must not run".into()))
            })
            .await;

        assert!(matches!(result, Err(LockError::LockTimeout { .. })));
        assert!(store.get("release:appcloud").await.unwrap().is_none());
        held.release().await.unwrap();
    }
}
