//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use bytes::Bytes;
use proptest::prelude::*;
use proptest::sample::Index;

use cutline::{Endpoint, SnapshotId, SnapshotRecord};

/// Generate an endpoint with a short lowercase host.
pub fn endpoint() -> impl Strategy<Value = Endpoint> {
    ("[a-z][a-z0-9-]{0,15}", 1u16..=u16::MAX).prop_map(|(host, port)| Endpoint::new(host, port))
}

/// Generate a random SnapshotId.
pub fn snapshot_id() -> impl Strategy<Value = SnapshotId> {
    any::<u64>().prop_map(SnapshotId)
}

/// Generate application payload bytes of at most `max_len` bytes.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a snapshot record with up to `max_links` distinct links, each
/// of which may have logged a few messages.
pub fn record(max_links: usize) -> impl Strategy<Value = SnapshotRecord> {
    (
        snapshot_id(),
        endpoint(),
        prop::option::of(payload(64)),
        prop::collection::btree_set(endpoint(), 0..=max_links),
    )
        .prop_flat_map(|(id, initiator, state, links)| {
            let links: Vec<Endpoint> = links.into_iter().collect();
            let logs = prop::collection::vec(
                prop::collection::vec(payload(32), 0..4),
                links.len(),
            );
            (Just((id, initiator, state, links)), logs)
        })
        .prop_map(|((id, initiator, state, links), logs)| {
            let mut record = SnapshotRecord::new(id, initiator, state.map(Bytes::from), links.clone());
            for (sender, payloads) in links.iter().zip(logs) {
                for payload in payloads {
                    record.log_message(sender, Bytes::from(payload));
                }
            }
            record
        })
}

/// Generate a permutation of `0..len`, the order in which `len` channels
/// deliver their marker.
pub fn marker_order(len: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..len).collect::<Vec<_>>()).prop_shuffle()
}

/// An undirected, connected topology over `size` cluster members.
#[derive(Debug, Clone)]
pub struct Topology {
    pub size: usize,
    /// Edges `(a, b)` with `a < b`, each listed once.
    pub edges: Vec<(usize, usize)>,
}

impl Topology {
    /// Build from a spanning tree (`parents[i]` picks the parent of member
    /// `i + 1` among `0..=i`) plus arbitrary extra edges.
    pub fn from_parts(size: usize, parents: &[Index], extra: &[(Index, Index)]) -> Self {
        let mut edges = BTreeSet::new();
        for (i, parent) in parents.iter().enumerate() {
            let child = i + 1;
            edges.insert((parent.index(child), child));
        }
        for (a, b) in extra {
            let (a, b) = (a.index(size), b.index(size));
            if a != b {
                edges.insert((a.min(b), a.max(b)));
            }
        }
        Self {
            size,
            edges: edges.into_iter().collect(),
        }
    }

    /// Members linked to `member`.
    pub fn neighbours(&self, member: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter_map(|&(a, b)| match member {
                m if m == a => Some(b),
                m if m == b => Some(a),
                _ => None,
            })
            .collect()
    }
}

/// Generate a connected topology of `2..=max_size` members.
pub fn topology(max_size: usize) -> impl Strategy<Value = Topology> {
    (2..=max_size.max(2)).prop_flat_map(|size| {
        (
            prop::collection::vec(any::<Index>(), size - 1),
            prop::collection::vec((any::<Index>(), any::<Index>()), 0..size),
        )
            .prop_map(move |(parents, extra)| Topology::from_parts(size, &parents, &extra))
    })
}

impl Arbitrary for Topology {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        topology(6).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reachable(topology: &Topology) -> usize {
        let mut seen = BTreeSet::from([0]);
        let mut frontier = vec![0];
        while let Some(member) = frontier.pop() {
            for next in topology.neighbours(member) {
                if seen.insert(next) {
                    frontier.push(next);
                }
            }
        }
        seen.len()
    }

    proptest! {
        #[test]
        fn topology_is_connected(topology: Topology) {
            prop_assert_eq!(reachable(&topology), topology.size);
        }

        #[test]
        fn topology_edges_are_normalised(topology: Topology) {
            for &(a, b) in &topology.edges {
                prop_assert!(a < b);
                prop_assert!(b < topology.size);
            }
        }

        #[test]
        fn endpoint_display_parses_back(ep in endpoint()) {
            let parsed: Endpoint = ep.to_string().parse().unwrap();
            prop_assert_eq!(parsed, ep);
        }

        #[test]
        fn snapshot_id_hex_parses_back(id in snapshot_id()) {
            prop_assert_eq!(SnapshotId::from_hex(&id.to_hex()).unwrap(), id);
        }

        #[test]
        fn record_logs_only_from_links(record in record(4)) {
            for sender in record.messages.keys() {
                prop_assert!(record.links.contains(sender));
            }
        }

        #[test]
        fn marker_order_is_a_permutation(order in marker_order(5)) {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
        }
    }
}
