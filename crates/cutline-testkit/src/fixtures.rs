//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: in-process clusters of real
//! nodes, a recording application connector, and scripted fake peers that
//! drive a node call by call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use cutline::core::{encode, Payload};
use cutline::net::{
    CallHandler, ErrorCode, MemoryNetwork, RemoteCall, RemoteNode, RemoteReply, Transport,
};
use cutline::store::MemorySink;
use cutline::{AppConnector, Endpoint, Node, NodeConfig, SnapshotId, StateHandle};

/// Port of the first cluster member; member `i` listens on `BASE_PORT + i`.
pub const BASE_PORT: u16 = 11111;

/// Default patience for asynchronous protocol steps in tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Endpoint of cluster member `i`.
pub fn endpoint(i: usize) -> Endpoint {
    Endpoint::new("localhost", BASE_PORT + i as u16)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll an async `condition` until it holds or `timeout` passes.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording application
// ─────────────────────────────────────────────────────────────────────────────

/// One callback observed by a [`RecordingApp`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent<M> {
    Message { sender: Endpoint, message: M },
    Connected(Endpoint),
    Disconnected(Endpoint),
    Restored(SnapshotId),
}

type MessageHook<M> = Arc<dyn Fn(&Endpoint, &M) + Send + Sync>;

/// Application connector that records every callback.
///
/// Cloning yields another handle to the same event log, so a test keeps one
/// clone and hands the other to the node.
pub struct RecordingApp<M> {
    events: Arc<Mutex<Vec<AppEvent<M>>>>,
    hook: Option<MessageHook<M>>,
}

impl<M> Clone for RecordingApp<M> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            hook: self.hook.clone(),
        }
    }
}

impl<M> Default for RecordingApp<M> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            hook: None,
        }
    }
}

impl<M: Clone> RecordingApp<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also run `hook` for every incoming message, after recording it.
    pub fn with_hook(hook: impl Fn(&Endpoint, &M) + Send + Sync + 'static) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            hook: Some(Arc::new(hook)),
        }
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Vec<AppEvent<M>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<AppEvent<M>> {
        self.log().clone()
    }

    /// Delivered messages with their senders, in delivery order.
    pub fn messages(&self) -> Vec<(Endpoint, M)> {
        self.log()
            .iter()
            .filter_map(|event| match event {
                AppEvent::Message { sender, message } => Some((sender.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn messages_from(&self, sender: &Endpoint) -> Vec<M> {
        self.messages()
            .into_iter()
            .filter(|(from, _)| from == sender)
            .map(|(_, message)| message)
            .collect()
    }

    pub fn connected(&self) -> Vec<Endpoint> {
        self.log()
            .iter()
            .filter_map(|event| match event {
                AppEvent::Connected(peer) => Some(peer.clone()),
                _ => None,
            })
            .collect()
    }

    /// Snapshots the node was rolled back to, in order.
    pub fn restored(&self) -> Vec<SnapshotId> {
        self.log()
            .iter()
            .filter_map(|event| match event {
                AppEvent::Restored(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn disconnected(&self) -> Vec<Endpoint> {
        self.log()
            .iter()
            .filter_map(|event| match event {
                AppEvent::Disconnected(peer) => Some(peer.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<M: Clone + Send + 'static> AppConnector<M> for RecordingApp<M> {
    fn on_incoming_message(&self, sender: &Endpoint, message: M) {
        if let Some(hook) = &self.hook {
            hook(sender, &message);
        }
        self.log().push(AppEvent::Message {
            sender: sender.clone(),
            message,
        });
    }

    fn on_new_connection(&self, peer: &Endpoint) {
        self.log().push(AppEvent::Connected(peer.clone()));
    }

    fn on_removed_connection(&self, peer: &Endpoint) {
        self.log().push(AppEvent::Disconnected(peer.clone()));
    }

    fn on_restored(&self, id: SnapshotId) {
        self.log().push(AppEvent::Restored(id));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cluster
// ─────────────────────────────────────────────────────────────────────────────

/// One node of a [`Cluster`] with the handles a test inspects.
pub struct Member<S, M> {
    pub endpoint: Endpoint,
    pub node: Node<S, M>,
    pub sink: Arc<MemorySink>,
    pub app: RecordingApp<M>,
}

/// Nodes on a shared [`MemoryNetwork`], each with its own [`MemorySink`].
pub struct Cluster<S, M> {
    pub network: MemoryNetwork,
    members: Vec<Member<S, M>>,
}

impl<S: Payload, M: Payload + Clone> Cluster<S, M> {
    /// Start `size` nodes with recording apps and the default config.
    pub async fn start(size: usize) -> cutline::Result<Self> {
        Self::start_with(size, NodeConfig::default(), |_, _| RecordingApp::new()).await
    }

    /// Start `size` nodes; `make_app` builds the app of member `i` and may
    /// keep that member's state handle.
    pub async fn start_with<F>(size: usize, config: NodeConfig, mut make_app: F) -> cutline::Result<Self>
    where
        F: FnMut(usize, StateHandle<S>) -> RecordingApp<M>,
    {
        let network = MemoryNetwork::new();
        let mut members = Vec::with_capacity(size);
        for i in 0..size {
            let sink = Arc::new(MemorySink::new());
            let node = Node::new(network.clone(), Arc::clone(&sink), config.clone());
            let app = make_app(i, node.state_handle());
            let requested = endpoint(i);
            let bound = node
                .init(requested.host(), requested.port(), app.clone())
                .await?;
            members.push(Member {
                endpoint: bound,
                node,
                sink,
                app,
            });
        }
        Ok(Self { network, members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, i: usize) -> &Member<S, M> {
        &self.members[i]
    }

    pub fn node(&self, i: usize) -> &Node<S, M> {
        &self.members[i].node
    }

    pub fn sink(&self, i: usize) -> &MemorySink {
        &self.members[i].sink
    }

    pub fn app(&self, i: usize) -> &RecordingApp<M> {
        &self.members[i].app
    }

    pub fn endpoint(&self, i: usize) -> &Endpoint {
        &self.members[i].endpoint
    }

    /// Link member `a` to member `b` (both directions).
    pub async fn link(&self, a: usize, b: usize) -> cutline::Result<()> {
        self.node(a).add_connection(self.endpoint(b)).await
    }

    /// Link every listed pair.
    pub async fn link_all(&self, edges: &[(usize, usize)]) -> cutline::Result<()> {
        for &(a, b) in edges {
            self.link(a, b).await?;
        }
        Ok(())
    }

    /// Whether every member has persisted snapshot `id`.
    pub fn all_persisted(&self, id: SnapshotId) -> bool {
        self.members.iter().all(|m| m.sink.get(id).is_some())
    }

    /// Wait until every member has persisted snapshot `id`.
    pub async fn wait_for_snapshot(&self, id: SnapshotId) -> bool {
        wait_until(WAIT, || self.all_persisted(id)).await
    }

    /// Stop every member.
    pub async fn stop(&self) -> cutline::Result<()> {
        for member in &self.members {
            member.node.stop().await?;
        }
        Ok(())
    }
}

/// Edges of a path `0 - 1 - ... - (size-1)`.
pub fn line(size: usize) -> Vec<(usize, usize)> {
    (1..size).map(|i| (i - 1, i)).collect()
}

/// Edges from member 0 to every other member.
pub fn star(size: usize) -> Vec<(usize, usize)> {
    (1..size).map(|i| (0, i)).collect()
}

/// Edges of a cycle over all members.
pub fn ring(size: usize) -> Vec<(usize, usize)> {
    let mut edges = line(size);
    if size > 2 {
        edges.push((size - 1, 0));
    }
    edges
}

/// A reproducible sequence of `count` directed sends along `edges`.
pub fn traffic_plan(seed: u64, edges: &[(usize, usize)], count: usize) -> Vec<(usize, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .filter_map(|_| {
            let &(a, b) = edges.get(rng.gen_range(0..edges.len().max(1)))?;
            Some(if rng.gen_bool(0.5) { (a, b) } else { (b, a) })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Fake peer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<RemoteCall>>,
    refuse_unlink: AtomicBool,
}

struct FakeHandler(Arc<FakeState>);

#[async_trait]
impl CallHandler for FakeHandler {
    async fn handle(&self, call: RemoteCall) -> RemoteReply {
        let reply = match &call {
            RemoteCall::UnregisterLinkRequest { .. }
                if self.0.refuse_unlink.load(Ordering::SeqCst) =>
            {
                RemoteReply::error(ErrorCode::SnapshotInterrupted, "snapshot running")
            }
            RemoteCall::ListLinks | RemoteCall::RestoreSnapshot { .. } => {
                RemoteReply::Links(Vec::new())
            }
            _ => RemoteReply::Done,
        };
        self.0
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        reply
    }
}

/// A scripted peer on a [`MemoryNetwork`].
///
/// It accepts every call, records it, and lets a test issue calls to a real
/// node one at a time, so protocol interleavings are exact.
pub struct FakePeer {
    endpoint: Endpoint,
    network: MemoryNetwork,
    state: Arc<FakeState>,
}

impl FakePeer {
    /// Bind a fake peer at `endpoint`.
    pub async fn bind(network: &MemoryNetwork, endpoint: Endpoint) -> cutline::net::Result<Self> {
        let state = Arc::new(FakeState::default());
        network
            .bind(&endpoint, Arc::new(FakeHandler(Arc::clone(&state))))
            .await?;
        Ok(Self {
            endpoint,
            network: network.clone(),
            state,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Markers received so far, as `(sender, initiator, id)`.
    pub fn markers(&self) -> Vec<(Endpoint, Endpoint, SnapshotId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::DeliverMarker {
                    sender,
                    initiator,
                    id,
                } => Some((sender, initiator, id)),
                _ => None,
            })
            .collect()
    }

    /// Requesters of every unlink request received so far.
    pub fn unlink_requests(&self) -> Vec<Endpoint> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::UnregisterLinkRequest { requester } => Some(requester),
                _ => None,
            })
            .collect()
    }

    /// Answer unlink requests with `SnapshotInterrupted` while set.
    pub fn refuse_unlink(&self, refuse: bool) {
        self.state.refuse_unlink.store(refuse, Ordering::SeqCst);
    }

    pub async fn send_marker(
        &self,
        to: &Endpoint,
        initiator: &Endpoint,
        id: SnapshotId,
    ) -> cutline::net::Result<()> {
        let remote = self.network.connect(to).await?;
        remote.deliver_marker(&self.endpoint, initiator, id).await
    }

    pub async fn send_message<M: Serialize>(
        &self,
        to: &Endpoint,
        message: &M,
    ) -> cutline::net::Result<()> {
        self.send_raw(to, encode(message)?).await
    }

    /// Send a payload without encoding it.
    pub async fn send_raw(&self, to: &Endpoint, payload: Bytes) -> cutline::net::Result<()> {
        let remote = self.network.connect(to).await?;
        remote.deliver_message(&self.endpoint, payload).await
    }

    /// Ask `to` to drop its link to this peer.
    pub async fn unlink_from(&self, to: &Endpoint) -> cutline::net::Result<()> {
        let remote = self.network.connect(to).await?;
        remote.unregister_link_request(&self.endpoint).await
    }

    /// Ask `to` to link to this peer.
    pub async fn link_to(&self, to: &Endpoint) -> cutline::net::Result<()> {
        let remote = self.network.connect(to).await?;
        remote.register_link_back(&self.endpoint).await
    }

    /// Ask `to` to roll back to snapshot `id`, as a restore coordinator.
    pub async fn restore(&self, to: &Endpoint, id: SnapshotId) -> cutline::net::Result<Vec<Endpoint>> {
        let remote = self.network.connect(to).await?;
        remote.restore_snapshot(&self.endpoint, id).await
    }

    /// Ask `to` to end the restore of `id`.
    pub async fn finish_restore(&self, to: &Endpoint, id: SnapshotId) -> cutline::net::Result<()> {
        let remote = self.network.connect(to).await?;
        remote.finish_restore(&self.endpoint, id).await
    }

    /// Tell `to` that `node` left the network.
    pub async fn report_removed(&self, to: &Endpoint, node: &Endpoint) -> cutline::net::Result<()> {
        let remote = self.network.connect(to).await?;
        remote.remove_node(&self.endpoint, node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topologies() {
        assert_eq!(line(3), vec![(0, 1), (1, 2)]);
        assert_eq!(star(3), vec![(0, 1), (0, 2)]);
        assert_eq!(ring(3), vec![(0, 1), (1, 2), (2, 0)]);
        assert_eq!(ring(2), vec![(0, 1)]);
    }

    #[test]
    fn test_traffic_plan_is_reproducible_and_follows_edges() {
        let edges = ring(4);
        let plan = traffic_plan(7, &edges, 50);
        assert_eq!(plan, traffic_plan(7, &edges, 50));
        assert_eq!(plan.len(), 50);
        for (a, b) in plan {
            assert!(edges.contains(&(a, b)) || edges.contains(&(b, a)));
        }
    }

    #[test]
    fn test_recording_app_sorts_events() {
        let app = RecordingApp::<String>::new();
        app.on_new_connection(&endpoint(1));
        app.on_incoming_message(&endpoint(1), "hi".to_string());
        app.on_removed_connection(&endpoint(1));

        assert_eq!(app.connected(), vec![endpoint(1)]);
        assert_eq!(app.messages_from(&endpoint(1)), vec!["hi".to_string()]);
        assert_eq!(app.disconnected(), vec![endpoint(1)]);
        assert_eq!(app.events().len(), 3);
    }
}
