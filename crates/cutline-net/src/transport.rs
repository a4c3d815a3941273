//! Transport abstraction for the remote node surface.
//!
//! A transport binds a [`CallHandler`] under a local endpoint and hands out
//! [`Connection`]s to remote endpoints. Every connection speaks the typed
//! [`RemoteNode`] operations through a blanket implementation, so transports
//! only move [`RemoteCall`]s and [`RemoteReply`]s.
//!
//! Contract for implementations: one reply per call, and calls issued
//! one after another on the same connection are handled in that order.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use cutline_core::{Endpoint, SnapshotId};

use crate::error::{NetError, Result};
use crate::messages::{RemoteCall, RemoteReply};

/// Inbound side: answers calls addressed to a bound endpoint.
///
/// Rejections travel back as [`RemoteReply::Error`], never as transport
/// failures.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Handle one call and produce its reply.
    async fn handle(&self, call: RemoteCall) -> RemoteReply;
}

/// Outbound side: a request/reply channel to one remote endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The endpoint this connection talks to.
    fn remote(&self) -> &Endpoint;

    /// Send a call and wait for its reply.
    async fn call(&self, call: RemoteCall) -> Result<RemoteReply>;
}

/// Shared handle to a remote node.
pub type RemoteHandle = Arc<dyn Connection>;

/// The operations one node invokes on another.
#[async_trait]
pub trait RemoteNode: Send + Sync {
    /// Deliver an application message from `sender`.
    async fn deliver_message(&self, sender: &Endpoint, payload: Bytes) -> Result<()>;

    /// Deliver the marker of snapshot `id` on the channel from `sender`.
    async fn deliver_marker(
        &self,
        sender: &Endpoint,
        initiator: &Endpoint,
        id: SnapshotId,
    ) -> Result<()>;

    /// Ask the remote node to link back to `requester`.
    async fn register_link_back(&self, requester: &Endpoint) -> Result<()>;

    /// Ask the remote node to drop its link to `requester`.
    async fn unregister_link_request(&self, requester: &Endpoint) -> Result<()>;

    /// Endpoints the remote node is linked to.
    async fn list_links(&self) -> Result<Vec<Endpoint>>;

    /// Ask the remote node to roll back to snapshot `id`. Returns the links
    /// it restored.
    async fn restore_snapshot(&self, requester: &Endpoint, id: SnapshotId)
        -> Result<Vec<Endpoint>>;

    /// Ask the remote node to end the restore of `id` and replay the
    /// messages that snapshot logged.
    async fn finish_restore(&self, requester: &Endpoint, id: SnapshotId) -> Result<()>;

    /// Tell the remote node that `node` left the network.
    async fn remove_node(&self, requester: &Endpoint, node: &Endpoint) -> Result<()>;
}

fn expect_done(call: &'static str, reply: RemoteReply) -> Result<()> {
    match reply {
        RemoteReply::Done => Ok(()),
        RemoteReply::Error { code, message } => Err(NetError::Remote { code, message }),
        other => Err(NetError::UnexpectedReply {
            call,
            reply: format!("{other:?}"),
        }),
    }
}

fn expect_links(call: &'static str, reply: RemoteReply) -> Result<Vec<Endpoint>> {
    match reply {
        RemoteReply::Links(links) => Ok(links),
        RemoteReply::Error { code, message } => Err(NetError::Remote { code, message }),
        other => Err(NetError::UnexpectedReply {
            call,
            reply: format!("{other:?}"),
        }),
    }
}

#[async_trait]
impl<C: Connection + ?Sized> RemoteNode for C {
    async fn deliver_message(&self, sender: &Endpoint, payload: Bytes) -> Result<()> {
        let call = RemoteCall::DeliverMessage {
            sender: sender.clone(),
            payload,
        };
        let name = call.name();
        expect_done(name, self.call(call).await?)
    }

    async fn deliver_marker(
        &self,
        sender: &Endpoint,
        initiator: &Endpoint,
        id: SnapshotId,
    ) -> Result<()> {
        let call = RemoteCall::DeliverMarker {
            sender: sender.clone(),
            initiator: initiator.clone(),
            id,
        };
        let name = call.name();
        expect_done(name, self.call(call).await?)
    }

    async fn register_link_back(&self, requester: &Endpoint) -> Result<()> {
        let call = RemoteCall::RegisterLinkBack {
            requester: requester.clone(),
        };
        let name = call.name();
        expect_done(name, self.call(call).await?)
    }

    async fn unregister_link_request(&self, requester: &Endpoint) -> Result<()> {
        let call = RemoteCall::UnregisterLinkRequest {
            requester: requester.clone(),
        };
        let name = call.name();
        expect_done(name, self.call(call).await?)
    }

    async fn list_links(&self) -> Result<Vec<Endpoint>> {
        expect_links("list_links", self.call(RemoteCall::ListLinks).await?)
    }

    async fn restore_snapshot(
        &self,
        requester: &Endpoint,
        id: SnapshotId,
    ) -> Result<Vec<Endpoint>> {
        let call = RemoteCall::RestoreSnapshot {
            requester: requester.clone(),
            id,
        };
        let name = call.name();
        expect_links(name, self.call(call).await?)
    }

    async fn finish_restore(&self, requester: &Endpoint, id: SnapshotId) -> Result<()> {
        let call = RemoteCall::FinishRestore {
            requester: requester.clone(),
            id,
        };
        let name = call.name();
        expect_done(name, self.call(call).await?)
    }

    async fn remove_node(&self, requester: &Endpoint, node: &Endpoint) -> Result<()> {
        let call = RemoteCall::RemoveNode {
            requester: requester.clone(),
            node: node.clone(),
        };
        let name = call.name();
        expect_done(name, self.call(call).await?)
    }
}

/// Binds local handlers and connects to remote endpoints.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting calls for `local`, answering them with `handler`.
    ///
    /// Returns the endpoint peers should use, which differs from `local`
    /// only when the transport picks the port (port 0).
    async fn bind(&self, local: &Endpoint, handler: Arc<dyn CallHandler>) -> Result<Endpoint>;

    /// Stop accepting calls for `local`. Unbinding an unbound endpoint is a
    /// no-op.
    async fn unbind(&self, local: &Endpoint) -> Result<()>;

    /// Open a connection to `remote`.
    async fn connect(&self, remote: &Endpoint) -> Result<RemoteHandle>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn bind(&self, local: &Endpoint, handler: Arc<dyn CallHandler>) -> Result<Endpoint> {
        (**self).bind(local, handler).await
    }

    async fn unbind(&self, local: &Endpoint) -> Result<()> {
        (**self).unbind(local).await
    }

    async fn connect(&self, remote: &Endpoint) -> Result<RemoteHandle> {
        (**self).connect(remote).await
    }
}

/// An in-process transport for tests and single-process clusters.
///
/// Calls are encoded to CBOR and decoded again on both legs, so the wire
/// format is exercised even though nothing leaves the process.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    use cutline_core::{decode, encode};

    type Handlers = Arc<RwLock<HashMap<Endpoint, Arc<dyn CallHandler>>>>;

    /// Shared routing table of an in-process network.
    ///
    /// Cloning yields another handle to the same network.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        handlers: Handlers,
    }

    impl MemoryNetwork {
        /// Create a new, empty network.
        pub fn new() -> Self {
            Self::default()
        }

        /// Whether a handler is bound at `endpoint`.
        pub async fn is_bound(&self, endpoint: &Endpoint) -> bool {
            self.handlers.read().await.contains_key(endpoint)
        }

        /// Every bound endpoint, sorted.
        pub async fn endpoints(&self) -> Vec<Endpoint> {
            let mut endpoints: Vec<_> = self.handlers.read().await.keys().cloned().collect();
            endpoints.sort();
            endpoints
        }
    }

    #[async_trait]
    impl Transport for MemoryNetwork {
        async fn bind(
            &self,
            local: &Endpoint,
            handler: Arc<dyn CallHandler>,
        ) -> Result<Endpoint> {
            let mut handlers = self.handlers.write().await;
            if handlers.contains_key(local) {
                return Err(NetError::AddressInUse(local.clone()));
            }
            handlers.insert(local.clone(), handler);
            tracing::debug!(local = %local, "memory endpoint bound");
            Ok(local.clone())
        }

        async fn unbind(&self, local: &Endpoint) -> Result<()> {
            if self.handlers.write().await.remove(local).is_some() {
                tracing::debug!(local = %local, "memory endpoint unbound");
            }
            Ok(())
        }

        async fn connect(&self, remote: &Endpoint) -> Result<RemoteHandle> {
            if !self.is_bound(remote).await {
                return Err(NetError::Unreachable(remote.clone()));
            }
            Ok(Arc::new(MemoryConnection {
                remote: remote.clone(),
                handlers: Arc::clone(&self.handlers),
            }))
        }
    }

    /// Connection to one endpoint of a [`MemoryNetwork`].
    ///
    /// The handler is looked up on every call, so a connection to a node
    /// that has since unbound fails with [`NetError::Unreachable`].
    pub struct MemoryConnection {
        remote: Endpoint,
        handlers: Handlers,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        fn remote(&self) -> &Endpoint {
            &self.remote
        }

        async fn call(&self, call: RemoteCall) -> Result<RemoteReply> {
            let handler = self
                .handlers
                .read()
                .await
                .get(&self.remote)
                .cloned()
                .ok_or_else(|| NetError::Unreachable(self.remote.clone()))?;

            let call: RemoteCall = decode(&encode(&call)?)?;
            let reply = handler.handle(call).await;
            Ok(decode(&encode(&reply)?)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::messages::ErrorCode;
    use std::sync::Mutex;

    /// Records every call and rejects markers.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<RemoteCall>>,
    }

    #[async_trait]
    impl CallHandler for Recorder {
        async fn handle(&self, call: RemoteCall) -> RemoteReply {
            self.calls.lock().unwrap().push(call.clone());
            match call {
                RemoteCall::DeliverMarker { .. } => {
                    RemoteReply::error(ErrorCode::DuplicateMarker, "seen")
                }
                RemoteCall::ListLinks => RemoteReply::Links(vec![Endpoint::new("localhost", 3)]),
                _ => RemoteReply::Done,
            }
        }
    }

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    #[tokio::test]
    async fn test_memory_calls_arrive_in_order() {
        let network = MemoryNetwork::new();
        let recorder = Arc::new(Recorder::default());
        network.bind(&ep(2), recorder.clone()).await.unwrap();

        let remote = network.connect(&ep(2)).await.unwrap();
        assert_eq!(remote.remote(), &ep(2));
        for i in 0..5u8 {
            remote
                .deliver_message(&ep(1), Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        remote.register_link_back(&ep(1)).await.unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 6);
        for (i, call) in calls.iter().take(5).enumerate() {
            assert_eq!(
                call,
                &RemoteCall::DeliverMessage {
                    sender: ep(1),
                    payload: Bytes::from(vec![i as u8]),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_memory_rejection_becomes_remote_error() {
        let network = MemoryNetwork::new();
        network
            .bind(&ep(2), Arc::new(Recorder::default()))
            .await
            .unwrap();
        let remote = network.connect(&ep(2)).await.unwrap();

        let err = remote
            .deliver_marker(&ep(1), &ep(1), SnapshotId(7))
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(ErrorCode::DuplicateMarker));

        assert_eq!(remote.list_links().await.unwrap(), vec![ep(3)]);
    }

    #[tokio::test]
    async fn test_memory_unbound_endpoint_is_unreachable() {
        let network = MemoryNetwork::new();
        assert!(matches!(
            network.connect(&ep(9)).await,
            Err(NetError::Unreachable(_))
        ));

        network
            .bind(&ep(2), Arc::new(Recorder::default()))
            .await
            .unwrap();
        let remote = network.connect(&ep(2)).await.unwrap();
        network.unbind(&ep(2)).await.unwrap();

        let err = remote.register_link_back(&ep(1)).await.unwrap_err();
        assert!(matches!(err, NetError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_memory_double_bind_fails() {
        let network = MemoryNetwork::new();
        network
            .bind(&ep(2), Arc::new(Recorder::default()))
            .await
            .unwrap();
        let err = network
            .bind(&ep(2), Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::AddressInUse(_)));
        assert_eq!(network.endpoints().await, vec![ep(2)]);
    }
}
