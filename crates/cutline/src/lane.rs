//! Outbound lanes: one FIFO queue and worker task per link.
//!
//! Application messages and markers for a peer go through the same lane,
//! so a marker queued after a message is delivered after it, and a message
//! queued after a marker is delivered after the marker. The worker waits
//! for each reply before sending the next item.
//!
//! Markers are queued under the node lock and must never wait, so the lane
//! queue itself is unbounded. The configured capacity is enforced with a
//! semaphore that only application messages take permits from.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use cutline_core::{Endpoint, SnapshotId};
use cutline_net::{NetError, RemoteHandle, RemoteNode};

/// Result of one message delivery, as seen by the sender.
pub(crate) type Delivery = oneshot::Receiver<cutline_net::Result<()>>;

enum Outbound {
    Message {
        payload: Bytes,
        reply: oneshot::Sender<cutline_net::Result<()>>,
        _permit: OwnedSemaphorePermit,
    },
    Marker {
        initiator: Endpoint,
        id: SnapshotId,
    },
}

/// Sending half of a link's outbound lane.
///
/// Cloning yields another handle to the same lane. The worker exits once
/// every handle is dropped and the queue is drained.
#[derive(Clone)]
pub(crate) struct Lane {
    tx: mpsc::UnboundedSender<Outbound>,
    permits: Arc<Semaphore>,
}

impl Lane {
    /// Start a worker delivering to `remote` on behalf of `local`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(local: Endpoint, remote: RemoteHandle, capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(local, remote, rx));
        Self {
            tx,
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Wait for room for one application message.
    pub(crate) async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Queue an application message. The returned receiver resolves once
    /// the peer answered.
    pub(crate) fn push_message(
        &self,
        payload: Bytes,
        permit: OwnedSemaphorePermit,
    ) -> Option<Delivery> {
        let (reply, delivery) = oneshot::channel();
        self.tx
            .send(Outbound::Message {
                payload,
                reply,
                _permit: permit,
            })
            .ok()?;
        Some(delivery)
    }

    /// Queue a marker. Returns false if the worker is gone.
    pub(crate) fn push_marker(&self, initiator: Endpoint, id: SnapshotId) -> bool {
        self.tx.send(Outbound::Marker { initiator, id }).is_ok()
    }

    /// Refuse new application messages. Already queued items are still
    /// delivered.
    pub(crate) fn close(&self) {
        self.permits.close();
    }
}

async fn run(local: Endpoint, remote: RemoteHandle, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let peer = remote.remote().clone();
    tracing::debug!(local = %local, peer = %peer, "lane started");

    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message {
                payload,
                reply,
                _permit,
            } => {
                let result = remote.deliver_message(&local, payload).await;
                // The sender may have stopped waiting.
                let _ = reply.send(result);
            }
            Outbound::Marker { initiator, id } => {
                match remote.deliver_marker(&local, &initiator, id).await {
                    Ok(()) => {
                        tracing::debug!(local = %local, peer = %peer, snapshot = %id, "marker sent");
                    }
                    Err(e) => {
                        tracing::warn!(
                            local = %local,
                            peer = %peer,
                            snapshot = %id,
                            error = %e,
                            "marker delivery failed"
                        );
                    }
                }
            }
        }
    }

    tracing::debug!(local = %local, peer = %peer, "lane closed");
}

/// Wait for a queued message's delivery result.
pub(crate) async fn delivered(delivery: Delivery) -> cutline_net::Result<()> {
    delivery.await.unwrap_or(Err(NetError::Closed))
}
