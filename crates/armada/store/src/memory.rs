//! In-memory repository
//!
//! Suitable for development, the simulated fleet and tests. Production
//! deployments should use a persistent backend.

use crate::error::{Result, StoreError};
use crate::repository::{Filter, Record, RecordId, Repository};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Repository backed by a concurrent map
pub struct InMemoryRepository<R: Record> {
    records: DashMap<RecordId, R>,
    next_id: AtomicU64,
}

impl<R: Record> InMemoryRepository<R> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R: Record> Default for InMemoryRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> Repository<R> for InMemoryRepository<R> {
    async fn create(&self, mut record: R) -> Result<R> {
        if !record.id().is_unset() {
            return Err(StoreError::AlreadyPersisted {
                kind: R::KIND,
                id: record.id(),
            });
        }

        let id = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
        record.set_id(id);
        self.records.insert(id, record.clone());
        trace!(kind = R::KIND, %id, "Created record");
        Ok(record)
    }

    async fn find(&self, id: RecordId) -> Result<Option<R>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn filter(&self, predicate: Filter<'_, R>) -> Result<Vec<R>> {
        let mut matched: Vec<R> = self
            .records
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        matched.sort_by_key(|r| r.id());
        Ok(matched)
    }

    async fn save(&self, record: &R) -> Result<()> {
        let id = record.id();
        match self.records.get_mut(&id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound { kind: R::KIND, id }),
        }
    }

    async fn destroy(&self, id: RecordId) -> Result<()> {
        if self.records.remove(&id).is_some() {
            trace!(kind = R::KIND, %id, "Destroyed record");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InstanceRecord, VmRecord};

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let repo = InMemoryRepository::<VmRecord>::new();
        let a = repo.create(VmRecord::new(RecordId(1), "agent-a")).await.unwrap();
        let b = repo.create(VmRecord::new(RecordId(1), "agent-b")).await.unwrap();

        assert!(a.id < b.id);
        assert_eq!(repo.len(), 2);
        assert!(matches!(
            repo.create(a.clone()).await,
            Err(StoreError::AlreadyPersisted { .. })
        ));
    }

    #[tokio::test]
    async fn test_filter_returns_creation_order() {
        let repo = InMemoryRepository::<InstanceRecord>::new();
        for index in 0..5 {
            repo.create(InstanceRecord::new(RecordId(7), "web", index))
                .await
                .unwrap();
        }
        repo.create(InstanceRecord::new(RecordId(8), "web", 0))
            .await
            .unwrap();

        let found = repo
            .filter(&|r: &InstanceRecord| r.deployment_id == RecordId(7))
            .await
            .unwrap();
        let indices: Vec<_> = found.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_save_requires_existing_record() {
        let repo = InMemoryRepository::<InstanceRecord>::new();
        let mut record = repo
            .create(InstanceRecord::new(RecordId(1), "db", 0))
            .await
            .unwrap();

        record.vm_id = Some(RecordId(3));
        repo.save(&record).await.unwrap();
        assert_eq!(
            repo.find(record.id).await.unwrap().unwrap().vm_id,
            Some(RecordId(3))
        );

        repo.destroy(record.id).await.unwrap();
        repo.destroy(record.id).await.unwrap();
        assert!(matches!(
            repo.save(&record).await,
            Err(StoreError::NotFound { kind: "instance", .. })
        ));
    }
}
