//! Generic record repository

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned record identifier, `0` before the record is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A persisted record kind
pub trait Record: Clone + Send + Sync + 'static {
    /// Human readable kind, used in errors and logs
    const KIND: &'static str;

    fn id(&self) -> RecordId;
    fn set_id(&mut self, id: RecordId);
}

/// Predicate used by [`Repository::filter`]
pub type Filter<'a, R> = &'a (dyn Fn(&R) -> bool + Send + Sync);

/// Persistence of one record kind
#[async_trait]
pub trait Repository<R: Record>: Send + Sync {
    /// Persist a new record and return it with its assigned id
    async fn create(&self, record: R) -> Result<R>;

    async fn find(&self, id: RecordId) -> Result<Option<R>>;

    /// Records matching `predicate`, in creation order
    async fn filter(&self, predicate: Filter<'_, R>) -> Result<Vec<R>>;

    /// Overwrite an existing record
    async fn save(&self, record: &R) -> Result<()>;

    /// Delete a record; deleting a missing record is not an error
    async fn destroy(&self, id: RecordId) -> Result<()>;

    /// First record matching `predicate`, in creation order
    async fn first(&self, predicate: Filter<'_, R>) -> Result<Option<R>> {
        Ok(self.filter(predicate).await?.into_iter().next())
    }
}
