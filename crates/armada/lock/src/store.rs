//! Shared lease storage

use crate::error::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Key/value store with the conditional writes a lease needs
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create `key` only if absent; false if it already exists
    async fn create(&self, key: &str, value: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value only if it is still `expected`
    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool>;

    /// Delete the key only if its value is still `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Lease store for a single director process and tests
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<String, String>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn create(&self, key: &str, value: &str) -> Result<bool> {
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.leases.get(key).map(|v| v.value().clone()))
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool> {
        match self.leases.get_mut(key) {
            Some(mut current) if current.as_str() == expected => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, current| current == expected)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = InMemoryLeaseStore::new();

        assert!(store.create("k", "a").await.unwrap());
        assert!(!store.create("k", "b").await.unwrap());

        assert!(!store.compare_and_swap("k", "b", "c").await.unwrap());
        assert!(store.compare_and_swap("k", "a", "c").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("c"));

        assert!(!store.compare_and_delete("k", "a").await.unwrap());
        assert!(store.compare_and_delete("k", "c").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }
}
