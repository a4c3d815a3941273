//! In-memory implementation of the SnapshotSink trait.
//!
//! This is primarily for testing. It has the same semantics as the durable
//! sinks but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use cutline_core::{SnapshotId, SnapshotRecord};

use crate::error::{Result, StoreError};
use crate::traits::SnapshotSink;

/// In-memory sink implementation.
///
/// All data is lost when the sink is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemorySink {
    inner: RwLock<MemorySinkInner>,
}

#[derive(Default)]
struct MemorySinkInner {
    /// Records indexed by snapshot id.
    records: HashMap<SnapshotId, SnapshotRecord>,

    /// Persistence order.
    order: Vec<SnapshotId>,
}

impl MemorySink {
    /// Create a new empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted records.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    /// Whether nothing has been persisted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persisted ids, oldest first, without going through the async trait.
    pub fn ids(&self) -> Vec<SnapshotId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    /// A persisted record, without going through the async trait.
    pub fn get(&self, id: SnapshotId) -> Option<SnapshotRecord> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(&id)
            .cloned()
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn persist(&self, record: &SnapshotRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if inner.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }

        inner.records.insert(record.id, record.clone());
        inner.order.push(record.id);
        Ok(())
    }

    async fn load(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>> {
        Ok(self.get(id))
    }

    async fn list(&self) -> Result<Vec<SnapshotId>> {
        Ok(self.ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutline_core::{encode, Endpoint};

    fn record(counter: u64) -> SnapshotRecord {
        let initiator = Endpoint::new("localhost", 11111);
        let mut r = SnapshotRecord::new(
            SnapshotId::derive(&initiator, counter),
            initiator,
            Some(encode(&counter).unwrap()),
            vec![Endpoint::new("localhost", 11112)],
        );
        r.log_message(&Endpoint::new("localhost", 11112), encode("hi").unwrap());
        r
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let sink = MemorySink::new();
        let r = record(0);

        sink.persist(&r).await.unwrap();

        assert_eq!(sink.load(r.id).await.unwrap(), Some(r.clone()));
        assert_eq!(sink.list().await.unwrap(), vec![r.id]);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_twice_fails() {
        let sink = MemorySink::new();
        let r = record(0);

        sink.persist(&r).await.unwrap();
        let err = sink.persist(&r).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == r.id));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_follows_persist_order() {
        let sink = MemorySink::new();
        assert!(sink.latest().await.unwrap().is_none());

        sink.persist(&record(5)).await.unwrap();
        sink.persist(&record(1)).await.unwrap();

        let latest = sink.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, record(1).id);
    }

    #[tokio::test]
    async fn test_load_unknown_is_none() {
        let sink = MemorySink::new();
        assert!(sink.load(SnapshotId(42)).await.unwrap().is_none());
    }
}
