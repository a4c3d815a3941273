//! TCP transport.
//!
//! Each bound endpoint owns a listener task. Every accepted connection is
//! served by its own task, which answers calls strictly one at a time, so
//! calls issued in order on one [`TcpConnection`] are handled in order.
//! Calls and replies travel as length-prefixed CBOR frames (see
//! [`crate::frame`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use cutline_core::{decode, encode, Endpoint};

use crate::error::{NetError, Result};
use crate::frame::{read_frame, write_frame};
use crate::messages::{ErrorCode, RemoteCall, RemoteReply};
use crate::transport::{CallHandler, Connection, RemoteHandle, Transport};

/// Configuration for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Largest accepted call or reply body.
    pub max_frame_bytes: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Transport over plain TCP sockets.
pub struct TcpTransport {
    config: TcpConfig,
    listeners: Mutex<HashMap<Endpoint, JoinHandle<()>>>,
}

impl TcpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpConfig::default())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let listeners = self
            .listeners
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, task) in listeners.drain() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: Endpoint,
    handler: Arc<dyn CallHandler>,
    max_frame_bytes: usize,
) {
    // Dropping the set aborts every connection task with the listener.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(local = %local, peer_addr = %addr, "connection accepted");
                    let handler = Arc::clone(&handler);
                    connections.spawn(serve_connection(stream, handler, max_frame_bytes));
                }
                Err(e) => {
                    tracing::warn!(local = %local, error = %e, "accept failed");
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Ok(Err(e)) = finished {
                    tracing::debug!(local = %local, error = %e, "connection closed with error");
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn CallHandler>,
    max_frame_bytes: usize,
) -> Result<()> {
    while let Some(body) = read_frame(&mut stream, max_frame_bytes).await? {
        let reply = match decode::<RemoteCall>(&body) {
            Ok(call) => handler.handle(call).await,
            Err(e) => RemoteReply::error(ErrorCode::InternalError, e.to_string()),
        };
        write_frame(&mut stream, &encode(&reply)?, max_frame_bytes).await?;
    }
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self, local: &Endpoint, handler: Arc<dyn CallHandler>) -> Result<Endpoint> {
        let listener = TcpListener::bind((local.host(), local.port())).await?;
        let bound = Endpoint::new(local.host(), listener.local_addr()?.port());

        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(&bound) {
            return Err(NetError::AddressInUse(bound));
        }
        let task = tokio::spawn(accept_loop(
            listener,
            bound.clone(),
            handler,
            self.config.max_frame_bytes,
        ));
        listeners.insert(bound.clone(), task);

        tracing::info!(local = %bound, "tcp endpoint bound");
        Ok(bound)
    }

    async fn unbind(&self, local: &Endpoint) -> Result<()> {
        let task = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(local);
        if let Some(task) = task {
            task.abort();
            // Wait for the listener socket to be dropped.
            let _ = task.await;
            tracing::info!(local = %local, "tcp endpoint unbound");
        }
        Ok(())
    }

    async fn connect(&self, remote: &Endpoint) -> Result<RemoteHandle> {
        let connecting = TcpStream::connect((remote.host(), remote.port()));
        let stream = match tokio::time::timeout(self.config.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(NetError::Unreachable(remote.clone()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(NetError::Timeout(remote.clone())),
        };
        stream.set_nodelay(true)?;

        Ok(Arc::new(TcpConnection {
            remote: remote.clone(),
            max_frame_bytes: self.config.max_frame_bytes,
            stream: tokio::sync::Mutex::new(Some(stream)),
        }))
    }
}

/// One TCP connection to a remote endpoint.
///
/// Calls are serialized on the connection. The stream is checked out for
/// the length of a call and returned only after a complete reply, so a call
/// that fails or is dropped midway closes the connection and every later
/// call fails with [`NetError::Closed`].
pub struct TcpConnection {
    remote: Endpoint,
    max_frame_bytes: usize,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

#[async_trait]
impl Connection for TcpConnection {
    fn remote(&self) -> &Endpoint {
        &self.remote
    }

    async fn call(&self, call: RemoteCall) -> Result<RemoteReply> {
        let request = encode(&call)?;
        if request.len() > self.max_frame_bytes {
            return Err(NetError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: request.len(),
            });
        }

        let mut slot = self.stream.lock().await;
        let mut stream = slot.take().ok_or(NetError::Closed)?;
        write_frame(&mut stream, &request, self.max_frame_bytes).await?;
        let body = match read_frame(&mut stream, self.max_frame_bytes).await? {
            Some(body) => body,
            None => return Err(NetError::Closed),
        };
        *slot = Some(stream);
        Ok(decode(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RemoteNode;
    use bytes::Bytes;
    use cutline_core::SnapshotId;

    /// Counts messages and answers ListLinks with a fixed peer.
    #[derive(Default)]
    struct Counter {
        messages: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl CallHandler for Counter {
        async fn handle(&self, call: RemoteCall) -> RemoteReply {
            match call {
                RemoteCall::DeliverMessage { payload, .. } => {
                    self.messages.lock().unwrap().push(payload);
                    RemoteReply::Done
                }
                RemoteCall::DeliverMarker { .. } => {
                    RemoteReply::error(ErrorCode::UnknownSender, "who are you")
                }
                RemoteCall::ListLinks => RemoteReply::Links(vec![Endpoint::new("peer", 1)]),
                _ => RemoteReply::Done,
            }
        }
    }

    /// Answers ListLinks with `count` peers.
    struct Crowd {
        count: u16,
    }

    #[async_trait]
    impl CallHandler for Crowd {
        async fn handle(&self, call: RemoteCall) -> RemoteReply {
            match call {
                RemoteCall::ListLinks => RemoteReply::Links(
                    (1..=self.count).map(|p| Endpoint::new("peer", p)).collect(),
                ),
                _ => RemoteReply::Done,
            }
        }
    }

    fn any_port() -> Endpoint {
        Endpoint::new("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_tcp_roundtrip_preserves_order() {
        let transport = TcpTransport::default();
        let counter = Arc::new(Counter::default());
        let bound = transport.bind(&any_port(), counter.clone()).await.unwrap();
        assert_ne!(bound.port(), 0);

        let remote = transport.connect(&bound).await.unwrap();
        let me = Endpoint::new("127.0.0.1", 1);
        for i in 0..20u8 {
            remote
                .deliver_message(&me, Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        let got = counter.messages.lock().unwrap().clone();
        let expected: Vec<_> = (0..20u8).map(|i| Bytes::from(vec![i])).collect();
        assert_eq!(got, expected);
        assert_eq!(
            remote.list_links().await.unwrap(),
            vec![Endpoint::new("peer", 1)]
        );
    }

    #[tokio::test]
    async fn test_tcp_remote_error() {
        let transport = TcpTransport::default();
        let bound = transport
            .bind(&any_port(), Arc::new(Counter::default()))
            .await
            .unwrap();
        let remote = transport.connect(&bound).await.unwrap();

        let err = remote
            .deliver_marker(&bound, &bound, SnapshotId(1))
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(ErrorCode::UnknownSender));
    }

    #[tokio::test]
    async fn test_tcp_unbind_closes_connections() {
        let transport = TcpTransport::default();
        let bound = transport
            .bind(&any_port(), Arc::new(Counter::default()))
            .await
            .unwrap();
        let remote = transport.connect(&bound).await.unwrap();
        remote.register_link_back(&bound).await.unwrap();

        transport.unbind(&bound).await.unwrap();

        assert!(remote.register_link_back(&bound).await.is_err());
        assert!(transport.connect(&bound).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_oversize_call_keeps_connection() {
        let transport = TcpTransport::new(TcpConfig {
            max_frame_bytes: 64,
            ..TcpConfig::default()
        });
        let counter = Arc::new(Counter::default());
        let bound = transport.bind(&any_port(), counter.clone()).await.unwrap();
        let remote = transport.connect(&bound).await.unwrap();

        let err = remote
            .deliver_message(&bound, Bytes::from(vec![0u8; 256]))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { .. }));
        remote
            .deliver_message(&bound, Bytes::from_static(b"small"))
            .await
            .unwrap();
        assert_eq!(counter.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_failed_read_closes_connection() {
        let server = TcpTransport::default();
        let bound = server
            .bind(&any_port(), Arc::new(Crowd { count: 200 }))
            .await
            .unwrap();
        let client = TcpTransport::new(TcpConfig {
            max_frame_bytes: 256,
            ..TcpConfig::default()
        });
        let remote = client.connect(&bound).await.unwrap();

        let err = remote.list_links().await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { .. }));

        // The unread reply body would otherwise be taken for the next reply.
        let err = remote.register_link_back(&bound).await.unwrap_err();
        assert!(matches!(err, NetError::Closed));
        let err = remote.list_links().await.unwrap_err();
        assert!(matches!(err, NetError::Closed));
    }
}
