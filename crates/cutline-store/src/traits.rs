//! SnapshotSink trait: the abstract interface for snapshot persistence.
//!
//! The snapshot engine is storage-agnostic. Implementations include a
//! directory layout, SQLite, and an in-memory sink for tests.

use std::sync::Arc;

use async_trait::async_trait;
use cutline_core::{SnapshotId, SnapshotRecord};

use crate::error::Result;

/// Async interface for persisting completed snapshot records.
///
/// All methods are async so blocking backends can move their work onto
/// `spawn_blocking` without stalling the runtime.
///
/// # Design Notes
///
/// - **Write once**: a second `persist` for the same id is an error.
/// - **Ordered listing**: `list` returns ids in persistence order.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Durably store a completed record.
    async fn persist(&self, record: &SnapshotRecord) -> Result<()>;

    /// Load a record by snapshot id.
    async fn load(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>>;

    /// Ids of every persisted record, oldest first.
    async fn list(&self) -> Result<Vec<SnapshotId>>;

    /// The most recently persisted record.
    async fn latest(&self) -> Result<Option<SnapshotRecord>> {
        match self.list().await?.last() {
            Some(id) => self.load(*id).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<T: SnapshotSink + ?Sized> SnapshotSink for Arc<T> {
    async fn persist(&self, record: &SnapshotRecord) -> Result<()> {
        (**self).persist(record).await
    }

    async fn load(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>> {
        (**self).load(id).await
    }

    async fn list(&self) -> Result<Vec<SnapshotId>> {
        (**self).list().await
    }

    async fn latest(&self) -> Result<Option<SnapshotRecord>> {
        (**self).latest().await
    }
}
