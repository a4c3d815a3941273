//! Snapshot ledger: the snapshots this node is currently recording.

use std::collections::BTreeMap;

use bytes::Bytes;

use cutline_core::{Endpoint, SnapshotId, SnapshotRecord};

/// Records of running snapshots, keyed by id.
#[derive(Debug, Default)]
pub(crate) struct SnapshotLedger {
    running: BTreeMap<SnapshotId, SnapshotRecord>,
}

impl SnapshotLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start tracking a record. Returns false, leaving the ledger unchanged,
    /// if a record with the same id is already running.
    pub(crate) fn insert(&mut self, record: SnapshotRecord) -> bool {
        if self.running.contains_key(&record.id) {
            return false;
        }
        self.running.insert(record.id, record);
        true
    }

    pub(crate) fn contains(&self, id: SnapshotId) -> bool {
        self.running.contains_key(&id)
    }

    pub(crate) fn get(&self, id: SnapshotId) -> Option<&SnapshotRecord> {
        self.running.get(&id)
    }

    /// Stop tracking a record and hand it out.
    pub(crate) fn remove(&mut self, id: SnapshotId) -> Option<SnapshotRecord> {
        self.running.remove(&id)
    }

    /// Append an in-transit message to the log of every running snapshot
    /// that was opened with `sender` linked and for which `recording` holds.
    /// A link added after a record was opened is not part of that cut.
    pub(crate) fn log_message<F>(&mut self, sender: &Endpoint, payload: &Bytes, recording: F) -> usize
    where
        F: Fn(SnapshotId) -> bool,
    {
        let mut logged = 0;
        for (id, record) in self.running.iter_mut() {
            if record.links.contains(sender) && recording(*id) {
                record.log_message(sender, payload.clone());
                logged += 1;
            }
        }
        logged
    }

    /// Ids of running snapshots, ascending.
    pub(crate) fn ids(&self) -> Vec<SnapshotId> {
        self.running.keys().copied().collect()
    }

    /// Drop every running snapshot.
    pub(crate) fn clear(&mut self) -> Vec<SnapshotId> {
        let ids = self.ids();
        self.running.clear();
        ids
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.running.len()
    }
}
