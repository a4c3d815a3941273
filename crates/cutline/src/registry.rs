//! Channel registry: the peers linked to this node.
//!
//! Each link remembers which snapshot markers have already arrived on the
//! channel from that peer. Marker sets only grow; an id is kept after its
//! snapshot completes so a late duplicate is still detected.

use std::collections::{BTreeMap, HashSet};

use cutline_core::{Endpoint, SnapshotId};
use cutline_net::RemoteHandle;

use crate::error::{NodeError, Result};
use crate::lane::Lane;
use crate::ledger::SnapshotLedger;

/// This node's record of one connected peer.
pub(crate) struct Link {
    pub(crate) remote: RemoteHandle,
    pub(crate) lane: Lane,
    markers: HashSet<SnapshotId>,
}

impl Link {
    pub(crate) fn new(remote: RemoteHandle, lane: Lane) -> Self {
        Self {
            remote,
            lane,
            markers: HashSet::new(),
        }
    }

    /// Whether the marker of `id` already arrived on this channel.
    pub(crate) fn has_marker(&self, id: SnapshotId) -> bool {
        self.markers.contains(&id)
    }
}

/// Links of one node, keyed by peer endpoint.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    links: BTreeMap<Endpoint, Link>,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a link.
    pub(crate) fn add_link(&mut self, endpoint: Endpoint, link: Link) -> Result<()> {
        if self.links.contains_key(&endpoint) {
            return Err(NodeError::LinkAlreadyPresent(endpoint));
        }
        self.links.insert(endpoint, link);
        Ok(())
    }

    /// Remove a link. Refused while any snapshot is running.
    pub(crate) fn remove_link(
        &mut self,
        endpoint: &Endpoint,
        ledger: &SnapshotLedger,
    ) -> Result<Link> {
        if !self.links.contains_key(endpoint) {
            return Err(NodeError::LinkNotFound(endpoint.clone()));
        }
        if !ledger.is_empty() {
            return Err(NodeError::ForbiddenWhileSnapshotting {
                running: ledger.len(),
            });
        }
        self.take(endpoint)
            .ok_or_else(|| NodeError::LinkNotFound(endpoint.clone()))
    }

    /// Remove a link without any check.
    pub(crate) fn take(&mut self, endpoint: &Endpoint) -> Option<Link> {
        let link = self.links.remove(endpoint)?;
        link.lane.close();
        Some(link)
    }

    /// Remove every link.
    pub(crate) fn drain(&mut self) -> Vec<(Endpoint, Link)> {
        let links = std::mem::take(&mut self.links);
        links
            .into_iter()
            .inspect(|(_, link)| link.lane.close())
            .collect()
    }

    pub(crate) fn lookup(&self, endpoint: &Endpoint) -> Result<&Link> {
        self.links
            .get(endpoint)
            .ok_or_else(|| NodeError::LinkNotFound(endpoint.clone()))
    }

    pub(crate) fn contains(&self, endpoint: &Endpoint) -> bool {
        self.links.contains_key(endpoint)
    }

    /// Linked endpoints, sorted.
    pub(crate) fn endpoints(&self) -> Vec<Endpoint> {
        self.links.keys().cloned().collect()
    }

    pub(crate) fn all_links(&self) -> impl Iterator<Item = (&Endpoint, &Link)> {
        self.links.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the marker of `id` already arrived from `sender`. False for
    /// unknown senders.
    pub(crate) fn has_marker(&self, sender: &Endpoint, id: SnapshotId) -> bool {
        self.links
            .get(sender)
            .is_some_and(|link| link.has_marker(id))
    }

    /// Record the marker of `id` on the channel from `sender`.
    pub(crate) fn record_marker(&mut self, sender: &Endpoint, id: SnapshotId) -> Result<()> {
        let link = self
            .links
            .get_mut(sender)
            .ok_or_else(|| NodeError::UnknownSender(sender.clone()))?;
        if !link.markers.insert(id) {
            return Err(NodeError::DuplicateMarker {
                sender: sender.clone(),
                id,
            });
        }
        Ok(())
    }

    /// Whether every one of `peers` has delivered the marker of `id`.
    /// A peer that is no longer linked counts as missing.
    pub(crate) fn all_have(&self, peers: &[Endpoint], id: SnapshotId) -> bool {
        peers.iter().all(|peer| self.has_marker(peer, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cutline_core::SnapshotRecord;
    use cutline_net::{CallHandler, MemoryNetwork, RemoteCall, RemoteReply, Transport};
    use std::sync::Arc;

    struct Sink;

    #[async_trait]
    impl CallHandler for Sink {
        async fn handle(&self, _call: RemoteCall) -> RemoteReply {
            RemoteReply::Done
        }
    }

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    async fn link_to(network: &MemoryNetwork, port: u16) -> Link {
        if !network.is_bound(&ep(port)).await {
            network.bind(&ep(port), Arc::new(Sink)).await.unwrap();
        }
        let remote = network.connect(&ep(port)).await.unwrap();
        let lane = Lane::spawn(ep(1), Arc::clone(&remote), 8);
        Link::new(remote, lane)
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let network = MemoryNetwork::new();
        let mut registry = ChannelRegistry::new();

        registry.add_link(ep(3), link_to(&network, 3).await).unwrap();
        registry.add_link(ep(2), link_to(&network, 2).await).unwrap();

        assert_eq!(registry.endpoints(), vec![ep(2), ep(3)]);
        assert!(registry.lookup(&ep(2)).is_ok());
        assert!(matches!(
            registry.lookup(&ep(4)),
            Err(NodeError::LinkNotFound(_))
        ));

        let err = registry
            .add_link(ep(2), link_to(&network, 2).await)
            .unwrap_err();
        assert!(matches!(err, NodeError::LinkAlreadyPresent(e) if e == ep(2)));
    }

    #[tokio::test]
    async fn test_remove_refused_while_snapshotting() {
        let network = MemoryNetwork::new();
        let mut registry = ChannelRegistry::new();
        registry.add_link(ep(2), link_to(&network, 2).await).unwrap();

        let mut ledger = SnapshotLedger::new();
        ledger.insert(SnapshotRecord::new(SnapshotId(1), ep(1), None, vec![ep(2)]));

        let err = registry.remove_link(&ep(2), &ledger).err().unwrap();
        assert!(matches!(
            err,
            NodeError::ForbiddenWhileSnapshotting { running: 1 }
        ));
        assert!(registry.contains(&ep(2)));

        ledger.remove(SnapshotId(1));
        assert!(registry.remove_link(&ep(2), &ledger).is_ok());
        assert!(matches!(
            registry.remove_link(&ep(2), &ledger).err().unwrap(),
            NodeError::LinkNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_marker_bookkeeping() {
        let network = MemoryNetwork::new();
        let mut registry = ChannelRegistry::new();
        registry.add_link(ep(2), link_to(&network, 2).await).unwrap();
        registry.add_link(ep(3), link_to(&network, 3).await).unwrap();
        let id = SnapshotId(9);

        registry.record_marker(&ep(2), id).unwrap();
        assert!(registry.has_marker(&ep(2), id));
        let peers = registry.endpoints();
        assert!(!registry.all_have(&peers, id));

        let err = registry.record_marker(&ep(2), id).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateMarker { .. }));

        let err = registry.record_marker(&ep(7), id).unwrap_err();
        assert!(matches!(err, NodeError::UnknownSender(_)));

        registry.record_marker(&ep(3), id).unwrap();
        assert!(registry.all_have(&peers, id));
        assert!(!registry.all_have(&[ep(2), ep(4)], id));
    }

    #[test]
    fn test_no_peers_means_complete() {
        assert!(ChannelRegistry::new().all_have(&[], SnapshotId(1)));
    }
}
