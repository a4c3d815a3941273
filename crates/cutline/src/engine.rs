//! The marker protocol engine.
//!
//! All protocol decisions happen under one node-wide lock, which is never
//! held across an `.await`. Application callbacks run while the lock is
//! held, so delivering a message and capturing state for a marker never
//! interleave. The state store has its own lock, taken after the node lock.
//!
//! The engine moves only encoded bytes; the typed layer lives in
//! [`crate::node`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;

use cutline_core::{Endpoint, SnapshotId, SnapshotRecord, StateStore};
use cutline_net::{
    CallHandler, ErrorCode, NetError, RemoteCall, RemoteHandle, RemoteNode, RemoteReply, Transport,
};
use cutline_store::SnapshotSink;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::lane::{self, Lane};
use crate::ledger::SnapshotLedger;
use crate::registry::{ChannelRegistry, Link};

/// Byte-level view of the application callbacks.
pub(crate) trait Inbox: Send + Sync {
    /// Decode and deliver one application message.
    fn on_message(&self, sender: &Endpoint, payload: &[u8]) -> Result<()>;

    fn on_new_connection(&self, peer: &Endpoint);

    fn on_removed_connection(&self, peer: &Endpoint);

    fn on_restored(&self, id: SnapshotId);
}

enum Phase {
    Created,
    Starting,
    Running {
        local: Endpoint,
        inbox: Arc<dyn Inbox>,
    },
    /// Rolled back to snapshot `id`. Sends, snapshots and topology changes
    /// are refused until the restore is finished, which replays `replay`.
    Restoring {
        local: Endpoint,
        inbox: Arc<dyn Inbox>,
        id: SnapshotId,
        replay: Vec<(Endpoint, Bytes)>,
    },
    Stopped,
}

/// Everything guarded by the node-wide lock.
struct NodeCore {
    phase: Phase,
    registry: ChannelRegistry,
    ledger: SnapshotLedger,
    /// Snapshots initiated here so far; feeds id derivation.
    counter: u64,
}

impl NodeCore {
    fn running(&self) -> Result<(&Endpoint, &Arc<dyn Inbox>)> {
        match &self.phase {
            Phase::Running { local, inbox } => Ok((local, inbox)),
            Phase::Restoring { .. } => Err(NodeError::RestoreInProgress),
            _ => Err(NodeError::NotInitialized),
        }
    }

    fn local(&self) -> Result<&Endpoint> {
        self.running().map(|(local, _)| local)
    }

    /// Like [`NodeCore::running`], but also while a restore is in progress.
    fn bound(&self) -> Result<(&Endpoint, &Arc<dyn Inbox>)> {
        match &self.phase {
            Phase::Running { local, inbox } | Phase::Restoring { local, inbox, .. } => {
                Ok((local, inbox))
            }
            _ => Err(NodeError::NotInitialized),
        }
    }

    fn restoring(&self) -> Option<SnapshotId> {
        match &self.phase {
            Phase::Restoring { id, .. } => Some(*id),
            _ => None,
        }
    }

    fn begin_restore(&mut self, id: SnapshotId) -> Result<()> {
        self.running()?;
        if !self.ledger.is_empty() {
            return Err(NodeError::ForbiddenWhileSnapshotting {
                running: self.ledger.len(),
            });
        }
        if let Phase::Running { local, inbox } = std::mem::replace(&mut self.phase, Phase::Starting)
        {
            self.phase = Phase::Restoring {
                local,
                inbox,
                id,
                replay: Vec::new(),
            };
        }
        Ok(())
    }

    /// Leave the restore and hand out the messages to replay.
    fn end_restore(&mut self) -> Vec<(Endpoint, Bytes)> {
        match std::mem::replace(&mut self.phase, Phase::Starting) {
            Phase::Restoring {
                local,
                inbox,
                replay,
                ..
            } => {
                self.phase = Phase::Running { local, inbox };
                replay
            }
            other => {
                self.phase = other;
                Vec::new()
            }
        }
    }

    /// Hand out the record of `id` if a marker for it arrived on every link
    /// the record was opened with.
    fn take_completed(&mut self, id: SnapshotId) -> Option<SnapshotRecord> {
        let done = self
            .ledger
            .get(id)
            .is_some_and(|record| self.registry.all_have(&record.links, id));
        if done {
            self.ledger.remove(id)
        } else {
            None
        }
    }
}

/// Shared state of one node.
pub(crate) struct Engine {
    core: Mutex<NodeCore>,
    state: Arc<StateStore>,
    sink: Arc<dyn SnapshotSink>,
    transport: Arc<dyn Transport>,
    config: NodeConfig,
}

impl Engine {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn SnapshotSink>,
        config: NodeConfig,
    ) -> Self {
        Self {
            core: Mutex::new(NodeCore {
                phase: Phase::Created,
                registry: ChannelRegistry::new(),
                ledger: SnapshotLedger::new(),
                counter: 0,
            }),
            state: Arc::new(StateStore::new()),
            sink,
            transport,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub(crate) fn sink(&self) -> &Arc<dyn SnapshotSink> {
        &self.sink
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind the node under `local` and start answering calls.
    pub(crate) async fn start(
        self: &Arc<Self>,
        local: Endpoint,
        inbox: Arc<dyn Inbox>,
    ) -> Result<Endpoint> {
        {
            let mut core = self.lock();
            if !matches!(core.phase, Phase::Created) {
                return Err(NodeError::AlreadyInitialized);
            }
            core.phase = Phase::Starting;
        }

        let handler: Arc<dyn CallHandler> = Arc::new(Dispatch(Arc::downgrade(self)));
        match self.transport.bind(&local, handler).await {
            Ok(bound) => {
                self.lock().phase = Phase::Running {
                    local: bound.clone(),
                    inbox,
                };
                tracing::info!(local = %bound, "node started");
                Ok(bound)
            }
            Err(e) => {
                self.lock().phase = Phase::Created;
                Err(e.into())
            }
        }
    }

    /// Drop every link and running snapshot, and unbind.
    pub(crate) async fn stop(&self) -> Result<()> {
        let local = {
            let mut core = self.lock();
            let local = core.bound()?.0.clone();
            core.phase = Phase::Stopped;
            let abandoned = core.ledger.clear();
            if !abandoned.is_empty() {
                tracing::warn!(
                    local = %local,
                    snapshots = ?abandoned,
                    "stopping with snapshots still running"
                );
            }
            core.registry.drain();
            local
        };

        self.transport.unbind(&local).await?;
        tracing::info!(local = %local, "node stopped");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn local_endpoint(&self) -> Option<Endpoint> {
        self.lock().bound().ok().map(|(local, _)| local.clone())
    }

    pub(crate) fn links(&self) -> Result<Vec<Endpoint>> {
        let core = self.lock();
        core.bound()?;
        Ok(core.registry.endpoints())
    }

    pub(crate) fn running_snapshots(&self) -> Vec<SnapshotId> {
        self.lock().ledger.ids()
    }

    fn is_linked(&self, peer: &Endpoint) -> bool {
        self.lock().registry.contains(peer)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Capture state, open a record for `id` and queue its marker on every
    /// link.
    fn start_recording(
        &self,
        core: &mut NodeCore,
        local: &Endpoint,
        initiator: &Endpoint,
        id: SnapshotId,
    ) {
        let record = SnapshotRecord::new(
            id,
            initiator.clone(),
            self.state.capture_current(),
            core.registry.endpoints(),
        );
        core.ledger.insert(record);

        for (peer, link) in core.registry.all_links() {
            if !link.lane.push_marker(initiator.clone(), id) {
                tracing::warn!(local = %local, peer = %peer, snapshot = %id, "lane gone, marker dropped");
            }
        }
        tracing::debug!(
            local = %local,
            snapshot = %id,
            links = core.registry.len(),
            "recording started"
        );
    }

    async fn persist(&self, local: &Endpoint, record: SnapshotRecord) -> Result<()> {
        let id = record.id;
        tracing::info!(
            local = %local,
            snapshot = %id,
            messages = record.message_count(),
            "snapshot complete"
        );
        if let Err(e) = self.sink.persist(&record).await {
            tracing::error!(local = %local, snapshot = %id, error = %e, "persisting snapshot failed");
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) async fn initiate_snapshot(&self) -> Result<SnapshotId> {
        let (local, id, completed) = {
            let mut core = self.lock();
            let local = core.local()?.clone();

            let mut id = SnapshotId::derive(&local, core.counter);
            core.counter += 1;
            while core.ledger.contains(id) {
                id = SnapshotId::derive(&local, core.counter);
                core.counter += 1;
            }

            tracing::info!(local = %local, snapshot = %id, "snapshot initiated");
            self.start_recording(&mut core, &local, &local, id);
            let completed = core.take_completed(id);
            (local, id, completed)
        };

        if let Some(record) = completed {
            self.persist(&local, record).await?;
        }
        Ok(id)
    }

    pub(crate) async fn receive_marker(
        &self,
        sender: &Endpoint,
        initiator: &Endpoint,
        id: SnapshotId,
    ) -> Result<()> {
        let (local, completed) = {
            let mut core = self.lock();
            let local = core.local()?.clone();

            if !core.registry.contains(sender) {
                tracing::warn!(local = %local, peer = %sender, snapshot = %id, "marker from unknown sender");
                return Err(NodeError::UnknownSender(sender.clone()));
            }
            if core.registry.has_marker(sender, id) {
                tracing::warn!(local = %local, peer = %sender, snapshot = %id, "duplicate marker");
                return Err(NodeError::DuplicateMarker {
                    sender: sender.clone(),
                    id,
                });
            }

            tracing::debug!(local = %local, peer = %sender, snapshot = %id, "marker received");
            if !core.ledger.contains(id) {
                self.start_recording(&mut core, &local, initiator, id);
            }
            core.registry.record_marker(sender, id)?;
            let completed = core.take_completed(id);
            (local, completed)
        };

        if let Some(record) = completed {
            self.persist(&local, record).await?;
        }
        Ok(())
    }

    pub(crate) fn receive_message(&self, sender: &Endpoint, payload: Bytes) -> Result<()> {
        let mut core = self.lock();
        let (local, inbox) = {
            let (local, inbox) = core.running()?;
            (local.clone(), Arc::clone(inbox))
        };

        if !core.registry.contains(sender) {
            drop(core);
            tracing::warn!(local = %local, peer = %sender, "message from unknown sender");
            if self.config.notify_unknown_senders {
                self.ask_to_unlink(local, sender.clone());
            }
            return Err(NodeError::UnknownSender(sender.clone()));
        }

        let NodeCore {
            registry, ledger, ..
        } = &mut *core;
        let logged = ledger.log_message(sender, &payload, |id| !registry.has_marker(sender, id));
        if logged > 0 {
            tracing::debug!(local = %local, peer = %sender, snapshots = logged, "in-transit message logged");
        }

        inbox.on_message(sender, &payload)
    }

    /// Tell `stranger` to drop its link to us, off the calling task.
    fn ask_to_unlink(&self, local: Endpoint, stranger: Endpoint) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let result = match transport.connect(&stranger).await {
                Ok(remote) => remote.unregister_link_request(&local).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!(local = %local, peer = %stranger, error = %e, "unlink request failed");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue `payload` on the lane to `peer` and wait for delivery.
    ///
    /// `change_state` runs under the node lock right before the message is
    /// queued, so no marker can separate the state change from the send.
    pub(crate) async fn send_message<F>(
        &self,
        peer: &Endpoint,
        payload: Bytes,
        change_state: F,
    ) -> Result<()>
    where
        F: FnOnce(&StateStore) -> Result<()> + Send,
    {
        let lane = {
            let core = self.lock();
            if core.local()? == peer {
                return Err(NodeError::SelfLink(peer.clone()));
            }
            core.registry.lookup(peer)?.lane.clone()
        };

        let permit = lane
            .reserve()
            .await
            .ok_or_else(|| NodeError::LinkNotFound(peer.clone()))?;

        let delivery = {
            let core = self.lock();
            core.local()?;
            let link = core.registry.lookup(peer)?;
            change_state(&self.state)?;
            link.lane
                .push_message(payload, permit)
                .ok_or(NodeError::Transport(NetError::Closed))?
        };

        lane::delivered(delivery).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Topology
    // ─────────────────────────────────────────────────────────────────────────

    fn insert_link(
        &self,
        core: &mut NodeCore,
        local: &Endpoint,
        peer: &Endpoint,
        remote: RemoteHandle,
    ) -> Result<()> {
        let lane = Lane::spawn(local.clone(), Arc::clone(&remote), self.config.lane_capacity);
        core.registry.add_link(peer.clone(), Link::new(remote, lane))
    }

    pub(crate) async fn add_connection(&self, peer: &Endpoint) -> Result<()> {
        {
            let core = self.lock();
            let local = core.local()?;
            if local == peer {
                return Err(NodeError::SelfLink(peer.clone()));
            }
            if core.registry.contains(peer) {
                return Err(NodeError::LinkAlreadyPresent(peer.clone()));
            }
        }

        let remote = self.transport.connect(peer).await?;

        // Link locally first so the peer's first message is not refused.
        let local = {
            let mut core = self.lock();
            let local = core.local()?.clone();
            self.insert_link(&mut core, &local, peer, Arc::clone(&remote))?;
            local
        };

        match remote.register_link_back(&local).await {
            Ok(()) => {
                let core = self.lock();
                let (_, inbox) = core.running()?;
                if core.registry.contains(peer) {
                    tracing::info!(local = %local, peer = %peer, "link added");
                    inbox.on_new_connection(peer);
                }
                Ok(())
            }
            Err(e) => {
                self.lock().registry.take(peer);
                tracing::warn!(local = %local, peer = %peer, error = %e, "peer refused link");
                Err(e.into())
            }
        }
    }

    pub(crate) async fn remove_connection(&self, peer: &Endpoint) -> Result<()> {
        let (local, remote) = {
            let core = self.lock();
            let local = core.local()?.clone();
            let link = core.registry.lookup(peer)?;
            if !core.ledger.is_empty() {
                return Err(NodeError::ForbiddenWhileSnapshotting {
                    running: core.ledger.len(),
                });
            }
            (local, Arc::clone(&link.remote))
        };

        let outcome = remote.unregister_link_request(&local).await;
        if let Err(NetError::Remote {
            code: ErrorCode::SnapshotInterrupted,
            ..
        }) = outcome
        {
            tracing::warn!(local = %local, peer = %peer, "peer is snapshotting, link kept");
            return Err(NodeError::SnapshotInterrupted(peer.clone()));
        }

        {
            let mut core = self.lock();
            let inbox = Arc::clone(core.running()?.1);
            let NodeCore {
                registry, ledger, ..
            } = &mut *core;
            registry.remove_link(peer, ledger)?;
            tracing::info!(local = %local, peer = %peer, "link removed");
            inbox.on_removed_connection(peer);
        }

        if let Err(e) = outcome {
            tracing::warn!(local = %local, peer = %peer, error = %e, "peer not told about removal");
        }
        Ok(())
    }

    /// Link to `gateway` and to every peer it is linked to.
    pub(crate) async fn join_network(&self, gateway: &Endpoint) -> Result<Vec<Endpoint>> {
        self.add_connection(gateway).await?;

        let (local, remote) = {
            let core = self.lock();
            let local = core.local()?.clone();
            (local, Arc::clone(&core.registry.lookup(gateway)?.remote))
        };

        let mut joined = vec![gateway.clone()];
        for peer in remote.list_links().await? {
            if peer == local || self.is_linked(&peer) {
                continue;
            }
            self.add_connection(&peer).await?;
            joined.push(peer);
        }
        tracing::info!(local = %local, gateway = %gateway, peers = joined.len(), "joined network");
        Ok(joined)
    }

    /// Remove every link. Every peer is attempted; the first failure is
    /// returned.
    pub(crate) async fn disconnect(&self) -> Result<Vec<Endpoint>> {
        let peers = {
            let core = self.lock();
            core.local()?;
            if !core.ledger.is_empty() {
                return Err(NodeError::ForbiddenWhileSnapshotting {
                    running: core.ledger.len(),
                });
            }
            core.registry.endpoints()
        };

        let mut first_error = None;
        for peer in &peers {
            if let Err(e) = self.remove_connection(peer).await {
                tracing::warn!(peer = %peer, error = %e, "disconnect from peer failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(peers),
        }
    }

    /// Tell every linked peer that `node` left the network, after dropping
    /// our own link to it. Every peer is attempted; the first failure is
    /// returned.
    pub(crate) async fn remove_node(&self, node: &Endpoint) -> Result<()> {
        let (local, peers) = {
            let mut core = self.lock();
            let (local, inbox) = {
                let (local, inbox) = core.running()?;
                (local.clone(), Arc::clone(inbox))
            };
            if &local == node {
                return Err(NodeError::SelfLink(node.clone()));
            }
            if !core.ledger.is_empty() {
                return Err(NodeError::ForbiddenWhileSnapshotting {
                    running: core.ledger.len(),
                });
            }
            if core.registry.take(node).is_some() {
                tracing::info!(local = %local, peer = %node, "link to departed node removed");
                inbox.on_removed_connection(node);
            }
            let peers: Vec<(Endpoint, RemoteHandle)> = core
                .registry
                .all_links()
                .map(|(peer, link)| (peer.clone(), Arc::clone(&link.remote)))
                .collect();
            (local, peers)
        };

        let mut first_error = None;
        for (peer, remote) in &peers {
            if let Err(e) = remote.remove_node(&local, node).await {
                tracing::warn!(local = %local, peer = %peer, departed = %node, error = %e, "peer not told about departure");
                first_error.get_or_insert(NodeError::from(e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Restore
    // ─────────────────────────────────────────────────────────────────────────

    /// Swap in the links and state `record` was taken with, and keep its
    /// logged messages for replay. Links the record does not list are
    /// dropped and their peers asked to unlink.
    async fn reinstate(&self, record: &SnapshotRecord) -> Result<()> {
        let missing: Vec<Endpoint> = {
            let core = self.lock();
            core.bound()?;
            record
                .links
                .iter()
                .filter(|peer| !core.registry.contains(peer))
                .cloned()
                .collect()
        };

        let mut connected = Vec::with_capacity(missing.len());
        for peer in missing {
            let remote = self.transport.connect(&peer).await.map_err(|e| {
                NodeError::RestoreNotPossible(format!("{peer} unreachable: {e}"))
            })?;
            connected.push((peer, remote));
        }

        let (local, dropped) = {
            let mut core = self.lock();
            let (local, inbox) = {
                let (local, inbox) = core.bound()?;
                (local.clone(), Arc::clone(inbox))
            };

            let dropped: Vec<Endpoint> = core
                .registry
                .endpoints()
                .into_iter()
                .filter(|peer| !record.links.contains(peer))
                .collect();
            for peer in &dropped {
                core.registry.take(peer);
                inbox.on_removed_connection(peer);
            }
            for (peer, remote) in connected {
                if core.registry.contains(&peer) {
                    continue;
                }
                self.insert_link(&mut core, &local, &peer, remote)?;
                inbox.on_new_connection(&peer);
            }

            self.state.restore(record.state.clone());
            if let Phase::Restoring { replay, .. } = &mut core.phase {
                *replay = record
                    .messages
                    .iter()
                    .flat_map(|(sender, payloads)| {
                        payloads.iter().map(move |payload| (sender.clone(), payload.clone()))
                    })
                    .collect();
            }
            (local, dropped)
        };

        for peer in dropped {
            self.ask_to_unlink(local.clone(), peer);
        }
        tracing::info!(
            local = %local,
            snapshot = %record.id,
            links = record.links.len(),
            "snapshot reinstated"
        );
        Ok(())
    }

    /// Leave the restore of `id` and hand the logged messages to the
    /// application as if they had just arrived.
    fn finish_restore_here(&self, id: SnapshotId) -> Result<()> {
        let mut core = self.lock();
        match core.restoring() {
            Some(current) if current == id => {}
            Some(_) => return Err(NodeError::RestoreInProgress),
            None => {
                core.running()?;
                return Ok(());
            }
        }

        let replay = core.end_restore();
        let (local, inbox) = core.running()?;
        inbox.on_restored(id);
        for (sender, payload) in &replay {
            if let Err(e) = inbox.on_message(sender, payload) {
                tracing::warn!(local = %local, peer = %sender, snapshot = %id, error = %e, "replayed message rejected");
            }
        }
        tracing::info!(local = %local, snapshot = %id, replayed = replay.len(), "restore finished");
        Ok(())
    }

    /// Roll the whole network back to the latest snapshot persisted here.
    ///
    /// Every node reachable through the recorded links restores its own
    /// record of the same snapshot. Once all of them have, each one leaves
    /// the restore and replays the messages its record logged.
    pub(crate) async fn restore_last_snapshot(&self) -> Result<SnapshotId> {
        let local = self.lock().local()?.clone();
        let record = self
            .sink
            .latest()
            .await?
            .ok_or_else(|| NodeError::RestoreNotPossible("no snapshot persisted".into()))?;
        let id = record.id;

        self.lock().begin_restore(id)?;
        tracing::info!(local = %local, snapshot = %id, "restore started");

        let mut restored = Vec::new();
        let outcome = self.restore_network(&local, &record, &mut restored).await;

        // Nodes already rolled back stay rolled back; all of them leave the
        // restore whatever the outcome.
        for (peer, remote) in &restored {
            if let Err(e) = remote.finish_restore(&local, id).await {
                tracing::warn!(local = %local, peer = %peer, snapshot = %id, error = %e, "peer did not finish restore");
            }
        }
        self.finish_restore_here(id)?;

        match outcome {
            Ok(()) => Ok(id),
            Err(e) => {
                tracing::warn!(local = %local, snapshot = %id, error = %e, "restore incomplete");
                Err(e)
            }
        }
    }

    async fn restore_network(
        &self,
        local: &Endpoint,
        record: &SnapshotRecord,
        restored: &mut Vec<(Endpoint, RemoteHandle)>,
    ) -> Result<()> {
        self.reinstate(record).await?;

        let mut visited = BTreeSet::from([local.clone()]);
        let mut pending: VecDeque<Endpoint> = record.links.iter().cloned().collect();
        while let Some(peer) = pending.pop_front() {
            if !visited.insert(peer.clone()) {
                continue;
            }
            let remote = self.transport.connect(&peer).await.map_err(|e| {
                NodeError::RestoreNotPossible(format!("{peer} unreachable: {e}"))
            })?;
            let links = remote.restore_snapshot(local, record.id).await?;
            restored.push((peer, remote));
            pending.extend(links);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mirror operations
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn register_link_back(&self, requester: &Endpoint) -> Result<()> {
        {
            let core = self.lock();
            let local = core.local()?;
            if local == requester {
                return Err(NodeError::SelfLink(requester.clone()));
            }
            if core.registry.contains(requester) {
                tracing::debug!(local = %local, peer = %requester, "already linked");
                return Ok(());
            }
        }

        let remote = self.transport.connect(requester).await?;

        let mut core = self.lock();
        let (local, inbox) = {
            let (local, inbox) = core.running()?;
            (local.clone(), Arc::clone(inbox))
        };
        if core.registry.contains(requester) {
            return Ok(());
        }
        self.insert_link(&mut core, &local, requester, remote)?;
        tracing::info!(local = %local, peer = %requester, "link added by peer");
        inbox.on_new_connection(requester);
        Ok(())
    }

    pub(crate) fn unregister_link_request(&self, requester: &Endpoint) -> Result<()> {
        let mut core = self.lock();
        let (local, inbox) = {
            let (local, inbox) = core.running()?;
            (local.clone(), Arc::clone(inbox))
        };

        if !core.ledger.is_empty() {
            tracing::warn!(
                local = %local,
                peer = %requester,
                running = core.ledger.len(),
                "peer removed link during snapshot"
            );
            return Err(NodeError::SnapshotInterrupted(requester.clone()));
        }

        if core.registry.take(requester).is_some() {
            tracing::info!(local = %local, peer = %requester, "link removed by peer");
            inbox.on_removed_connection(requester);
        }
        Ok(())
    }

    /// Roll back to our record of snapshot `id` on behalf of `requester`.
    /// Returns the links the record lists.
    pub(crate) async fn restore_snapshot(
        &self,
        requester: &Endpoint,
        id: SnapshotId,
    ) -> Result<Vec<Endpoint>> {
        {
            let mut core = self.lock();
            if core.restoring() == Some(id) {
                return Ok(core.registry.endpoints());
            }
            core.begin_restore(id).map_err(|e| match e {
                NodeError::ForbiddenWhileSnapshotting { .. } => {
                    NodeError::SnapshotInterrupted(requester.clone())
                }
                other => other,
            })?;
        }
        tracing::info!(peer = %requester, snapshot = %id, "restore requested");

        let outcome = match self.sink.load(id).await {
            Ok(Some(record)) => self.reinstate(&record).await.map(|()| record.links),
            Ok(None) => Err(NodeError::RestoreNotPossible(format!(
                "snapshot {id} is not persisted here"
            ))),
            Err(e) => Err(e.into()),
        };
        if outcome.is_err() {
            self.lock().end_restore();
        }
        outcome
    }

    pub(crate) fn finish_restore(&self, requester: &Endpoint, id: SnapshotId) -> Result<()> {
        tracing::debug!(peer = %requester, snapshot = %id, "restore finish requested");
        self.finish_restore_here(id)
    }

    /// Drop the link to `node`, which `requester` reports as gone.
    pub(crate) fn drop_departed(&self, requester: &Endpoint, node: &Endpoint) -> Result<()> {
        let mut core = self.lock();
        let (local, inbox) = {
            let (local, inbox) = core.running()?;
            (local.clone(), Arc::clone(inbox))
        };

        if !core.ledger.is_empty() {
            tracing::warn!(
                local = %local,
                peer = %requester,
                departed = %node,
                "departure reported during snapshot"
            );
            return Err(NodeError::SnapshotInterrupted(requester.clone()));
        }
        if &local == node {
            tracing::debug!(local = %local, peer = %requester, "reported as departed, ignored");
            return Ok(());
        }
        if core.registry.take(node).is_some() {
            tracing::info!(local = %local, peer = %node, reporter = %requester, "link to departed node removed");
            inbox.on_removed_connection(node);
        }
        Ok(())
    }
}

/// Inbound call handler bound to the transport.
///
/// Holds the engine weakly so a dropped node stops answering instead of
/// being kept alive by the transport.
struct Dispatch(Weak<Engine>);

#[async_trait]
impl CallHandler for Dispatch {
    async fn handle(&self, call: RemoteCall) -> RemoteReply {
        let Some(engine) = self.0.upgrade() else {
            return RemoteReply::error(ErrorCode::NotInitialized, "node dropped");
        };

        let op = call.name();
        let result = match call {
            RemoteCall::DeliverMessage { sender, payload } => engine
                .receive_message(&sender, payload)
                .map(|()| RemoteReply::Done),
            RemoteCall::DeliverMarker {
                sender,
                initiator,
                id,
            } => engine
                .receive_marker(&sender, &initiator, id)
                .await
                .map(|()| RemoteReply::Done),
            RemoteCall::RegisterLinkBack { requester } => engine
                .register_link_back(&requester)
                .await
                .map(|()| RemoteReply::Done),
            RemoteCall::UnregisterLinkRequest { requester } => engine
                .unregister_link_request(&requester)
                .map(|()| RemoteReply::Done),
            RemoteCall::ListLinks => engine.links().map(RemoteReply::Links),
            RemoteCall::RestoreSnapshot { requester, id } => engine
                .restore_snapshot(&requester, id)
                .await
                .map(RemoteReply::Links),
            RemoteCall::FinishRestore { requester, id } => engine
                .finish_restore(&requester, id)
                .map(|()| RemoteReply::Done),
            RemoteCall::RemoveNode { requester, node } => engine
                .drop_departed(&requester, &node)
                .map(|()| RemoteReply::Done),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!(op, error = %e, "call rejected");
            RemoteReply::error(e.code(), e.to_string())
        })
    }
}
