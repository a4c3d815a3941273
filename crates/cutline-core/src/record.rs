//! Snapshot records: one node's share of a global snapshot.
//!
//! A record is created when a node first learns of a snapshot (by initiating
//! it or by receiving its first marker). It then collects the messages that
//! were in transit on each incoming channel, and is handed to a sink once a
//! marker has arrived on every channel.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::types::{Endpoint, SnapshotId};

/// The local portion of a global snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Snapshot this record belongs to.
    pub id: SnapshotId,
    /// Node that started the snapshot.
    pub initiator: Endpoint,
    /// Encoded application state at the moment the record was created.
    /// `None` if the application never supplied a state.
    pub state: Option<Bytes>,
    /// Peers linked to this node when the record was created.
    pub links: Vec<Endpoint>,
    /// In-transit messages per sender, in arrival order.
    pub messages: BTreeMap<Endpoint, Vec<Bytes>>,
}

impl SnapshotRecord {
    /// Create a record with no logged messages.
    pub fn new(
        id: SnapshotId,
        initiator: Endpoint,
        state: Option<Bytes>,
        mut links: Vec<Endpoint>,
    ) -> Self {
        links.sort();
        Self {
            id,
            initiator,
            state,
            links,
            messages: BTreeMap::new(),
        }
    }

    /// Append an in-transit message received from `sender`.
    pub fn log_message(&mut self, sender: &Endpoint, payload: Bytes) {
        self.messages.entry(sender.clone()).or_default().push(payload);
    }

    /// Messages logged for `sender`, oldest first.
    pub fn messages_from(&self, sender: &Endpoint) -> &[Bytes] {
        self.messages.get(sender).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of logged messages across all senders.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }

    /// Decode the captured state.
    pub fn decode_state<S: DeserializeOwned>(&self) -> Result<Option<S>> {
        self.state.as_ref().map(|b| codec::decode(b)).transpose()
    }

    /// Decode every logged message.
    pub fn decode_messages<M: DeserializeOwned>(&self) -> Result<BTreeMap<Endpoint, Vec<M>>> {
        self.messages
            .iter()
            .map(|(sender, payloads)| {
                let decoded = payloads
                    .iter()
                    .map(|p| codec::decode(p))
                    .collect::<Result<Vec<M>>>()?;
                Ok((sender.clone(), decoded))
            })
            .collect()
    }

    /// Encode the whole record to CBOR.
    pub fn to_bytes(&self) -> Result<Bytes> {
        codec::encode(self)
    }

    /// Decode a record produced by [`SnapshotRecord::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    fn record() -> SnapshotRecord {
        SnapshotRecord::new(
            SnapshotId::derive(&ep(1), 0),
            ep(1),
            Some(codec::encode(&7u32).unwrap()),
            vec![ep(3), ep(2)],
        )
    }

    #[test]
    fn test_new_record_sorts_links() {
        let r = record();
        assert_eq!(r.links, vec![ep(2), ep(3)]);
        assert_eq!(r.message_count(), 0);
    }

    #[test]
    fn test_log_preserves_arrival_order_per_sender() {
        let mut r = record();
        r.log_message(&ep(2), codec::encode("a").unwrap());
        r.log_message(&ep(3), codec::encode("x").unwrap());
        r.log_message(&ep(2), codec::encode("b").unwrap());

        let decoded = r.decode_messages::<String>().unwrap();
        assert_eq!(decoded[&ep(2)], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(decoded[&ep(3)], vec!["x".to_string()]);
        assert_eq!(r.message_count(), 3);
        assert!(r.messages_from(&ep(4)).is_empty());
    }

    #[test]
    fn test_decode_state() {
        assert_eq!(record().decode_state::<u32>().unwrap(), Some(7));

        let empty = SnapshotRecord::new(SnapshotId(1), ep(1), None, vec![]);
        assert_eq!(empty.decode_state::<u32>().unwrap(), None);
    }

    #[test]
    fn test_record_bytes_roundtrip() {
        let mut r = record();
        r.log_message(&ep(2), codec::encode(&1u8).unwrap());
        let back = SnapshotRecord::from_bytes(&r.to_bytes().unwrap()).unwrap();
        assert_eq!(back, r);
    }
}
