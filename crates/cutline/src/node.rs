//! The typed node API.

use std::marker::PhantomData;
use std::sync::Arc;

use cutline_core::{codec, Endpoint, Payload, SnapshotId, SnapshotRecord, StateStore};
use cutline_net::Transport;
use cutline_store::SnapshotSink;

use crate::config::NodeConfig;
use crate::engine::{Engine, Inbox};
use crate::error::Result;

/// Callbacks from a node into the application.
///
/// Callbacks run while the node lock is held. They must not call
/// operations of the same node that wait on the network; updating state
/// through a [`StateHandle`] is allowed.
pub trait AppConnector<M>: Send + Sync + 'static {
    /// An application message arrived from a linked peer.
    fn on_incoming_message(&self, sender: &Endpoint, message: M);

    /// A link to `peer` was added, by either side.
    fn on_new_connection(&self, peer: &Endpoint) {
        let _ = peer;
    }

    /// The link to `peer` was removed, by either side.
    fn on_removed_connection(&self, peer: &Endpoint) {
        let _ = peer;
    }

    /// The node was rolled back to snapshot `id`. The restored state is
    /// readable through a [`StateHandle`]; the in-transit messages the
    /// snapshot logged are delivered right after this call.
    fn on_restored(&self, id: SnapshotId) {
        let _ = id;
    }
}

struct AppInbox<M, A> {
    app: A,
    _message: PhantomData<fn(M)>,
}

impl<M: Payload, A: AppConnector<M>> Inbox for AppInbox<M, A> {
    fn on_message(&self, sender: &Endpoint, payload: &[u8]) -> Result<()> {
        let message: M = codec::decode(payload)?;
        self.app.on_incoming_message(sender, message);
        Ok(())
    }

    fn on_new_connection(&self, peer: &Endpoint) {
        self.app.on_new_connection(peer);
    }

    fn on_removed_connection(&self, peer: &Endpoint) {
        self.app.on_removed_connection(peer);
    }

    fn on_restored(&self, id: SnapshotId) {
        self.app.on_restored(id);
    }
}

/// Write access to a node's application state, usable from callbacks.
pub struct StateHandle<S> {
    store: Arc<StateStore>,
    _state: PhantomData<fn(S)>,
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _state: PhantomData,
        }
    }
}

impl<S: Payload> StateHandle<S> {
    /// Replace the current state with a copy of `state`.
    pub fn update(&self, state: &S) -> Result<()> {
        self.store.update(state)?;
        Ok(())
    }

    /// Apply `change` to the current state, starting from `S::default()`
    /// if no state was stored yet.
    pub fn modify<F>(&self, change: F) -> Result<()>
    where
        S: Default,
        F: FnOnce(&mut S),
    {
        self.store.modify(change)?;
        Ok(())
    }

    /// A fresh copy of the current state.
    pub fn current(&self) -> Result<Option<S>> {
        Ok(self.store.capture_as()?)
    }
}

/// A completed snapshot with its state and messages decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<S, M> {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Node that started the snapshot.
    pub initiator: Endpoint,
    /// State captured when this node joined the snapshot.
    pub state: Option<S>,
    /// Peers linked when this node joined the snapshot.
    pub links: Vec<Endpoint>,
    /// In-transit messages per sender, in arrival order.
    pub messages: std::collections::BTreeMap<Endpoint, Vec<M>>,
}

impl<S: Payload, M: Payload> Snapshot<S, M> {
    /// Decode a persisted record.
    pub fn from_record(record: &SnapshotRecord) -> Result<Self> {
        Ok(Self {
            id: record.id,
            initiator: record.initiator.clone(),
            state: record.decode_state()?,
            links: record.links.clone(),
            messages: record.decode_messages()?,
        })
    }
}

/// One participant in the snapshot protocol.
///
/// `S` is the application state captured by snapshots and `M` the
/// application message exchanged between nodes. Both travel and persist as
/// CBOR. Cloning yields another handle to the same node.
///
/// Lifecycle: [`Node::new`] creates an unbound node, [`Node::init`] binds
/// it on the transport (once), [`Node::stop`] unbinds it for good.
pub struct Node<S, M> {
    engine: Arc<Engine>,
    _types: PhantomData<fn(S, M)>,
}

impl<S, M> Clone for Node<S, M> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            _types: PhantomData,
        }
    }
}

impl<S: Payload, M: Payload> Node<S, M> {
    /// Create a node that talks through `transport` and hands completed
    /// snapshots to `sink`.
    pub fn new(
        transport: impl Transport + 'static,
        sink: impl SnapshotSink + 'static,
        config: NodeConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(Arc::new(transport), Arc::new(sink), config)),
            _types: PhantomData,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind the node at `host:port` and start answering peers.
    ///
    /// Returns the endpoint peers should use; it differs from the request
    /// only when the transport assigns the port. Fails with
    /// `AlreadyInitialized` on a second call.
    pub async fn init(
        &self,
        host: impl Into<String>,
        port: u16,
        app: impl AppConnector<M>,
    ) -> Result<Endpoint> {
        let inbox = Arc::new(AppInbox {
            app,
            _message: PhantomData,
        });
        self.engine.start(Endpoint::new(host, port), inbox).await
    }

    /// Unbind the node. Links are dropped without notifying peers and
    /// running snapshots are abandoned.
    pub async fn stop(&self) -> Result<()> {
        self.engine.stop().await
    }

    /// The endpoint the node is bound at, while running.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.engine.local_endpoint()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Topology
    // ─────────────────────────────────────────────────────────────────────────

    /// Link to `peer`; the peer links back.
    pub async fn add_connection(&self, peer: &Endpoint) -> Result<()> {
        self.engine.add_connection(peer).await
    }

    /// Unlink from `peer`; the peer unlinks too. Refused while a snapshot
    /// is running here (`ForbiddenWhileSnapshotting`) or at the peer
    /// (`SnapshotInterrupted`).
    ///
    /// If the peer cannot be told, for example because it is gone, the
    /// link is still removed here and the call succeeds; the failure is
    /// logged.
    pub async fn remove_connection(&self, peer: &Endpoint) -> Result<()> {
        self.engine.remove_connection(peer).await
    }

    /// Link to `gateway` and to every peer the gateway is linked to.
    /// Returns the endpoints linked by this call.
    pub async fn join_network(&self, gateway: &Endpoint) -> Result<Vec<Endpoint>> {
        self.engine.join_network(gateway).await
    }

    /// Remove every link, notifying each peer. Returns the former peers.
    pub async fn disconnect(&self) -> Result<Vec<Endpoint>> {
        self.engine.disconnect().await
    }

    /// Drop the link to `node`, which left the network, and tell every
    /// linked peer to do the same. Refused while a snapshot is running.
    pub async fn remove_node(&self, node: &Endpoint) -> Result<()> {
        self.engine.remove_node(node).await
    }

    /// Linked peers, sorted.
    pub fn links(&self) -> Result<Vec<Endpoint>> {
        self.engine.links()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages and state
    // ─────────────────────────────────────────────────────────────────────────

    /// Send an application message to a linked peer and wait until it has
    /// been delivered.
    pub async fn send_message(&self, peer: &Endpoint, message: &M) -> Result<()> {
        let payload = codec::encode(message)?;
        self.engine.send_message(peer, payload, |_| Ok(())).await
    }

    /// Send an application message and apply `change` to the state in one
    /// step: a snapshot either sees the old state and the message in
    /// transit, or the new state and no message.
    pub async fn send_and_update<F>(&self, peer: &Endpoint, message: &M, change: F) -> Result<()>
    where
        S: Default,
        F: FnOnce(&mut S) + Send,
    {
        let payload = codec::encode(message)?;
        self.engine
            .send_message(peer, payload, move |store: &StateStore| {
                store.modify(change)?;
                Ok(())
            })
            .await
    }

    /// Replace the application state captured by future snapshots.
    pub fn update_state(&self, state: &S) -> Result<()> {
        self.state_handle().update(state)
    }

    /// A handle for updating state from application callbacks.
    pub fn state_handle(&self) -> StateHandle<S> {
        StateHandle {
            store: Arc::clone(self.engine.state()),
            _state: PhantomData,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a global snapshot and return its id. The call returns once
    /// the markers are queued; completion is observed through the sink.
    pub async fn initiate_snapshot(&self) -> Result<SnapshotId> {
        self.engine.initiate_snapshot().await
    }

    /// Snapshots currently being recorded here.
    pub fn running_snapshots(&self) -> Vec<SnapshotId> {
        self.engine.running_snapshots()
    }

    /// Load and decode a persisted snapshot.
    pub async fn load_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot<S, M>>> {
        match self.engine.sink().load(id).await? {
            Some(record) => Ok(Some(Snapshot::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Roll the network back to the most recent snapshot persisted here.
    ///
    /// Each node reachable through the snapshot's links reinstates the
    /// links and state of its own record of that snapshot, then replays the
    /// messages the record logged as in transit. While a node is restoring,
    /// sends, snapshots and topology changes fail with `RestoreInProgress`.
    /// Fails with `RestoreNotPossible` if nothing was persisted or a peer
    /// cannot be reached or lacks the record; nodes rolled back before the
    /// failure stay rolled back.
    pub async fn restore_last_snapshot(&self) -> Result<SnapshotId> {
        self.engine.restore_last_snapshot().await
    }

    /// Load and decode the most recently persisted snapshot.
    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot<S, M>>> {
        match self.engine.sink().latest().await? {
            Some(record) => Ok(Some(Snapshot::from_record(&record)?)),
            None => Ok(None),
        }
    }
}
