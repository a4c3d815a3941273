//! Wire messages for the remote node surface.
//!
//! Every remote operation is one request/reply exchange: the caller sends a
//! [`RemoteCall`] and waits for the matching [`RemoteReply`]. Both are
//! CBOR-encoded on the wire.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cutline_core::{Endpoint, SnapshotId};

/// A request from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCall {
    /// Deliver an application message.
    DeliverMessage {
        /// The sending node.
        sender: Endpoint,
        /// CBOR-encoded application message.
        payload: Bytes,
    },

    /// Deliver a snapshot marker.
    DeliverMarker {
        /// The node that put the marker on this channel.
        sender: Endpoint,
        /// The node that started the snapshot.
        initiator: Endpoint,
        /// The snapshot the marker belongs to.
        id: SnapshotId,
    },

    /// The requester added a link to us; add the reverse link.
    RegisterLinkBack {
        /// The node that added the link.
        requester: Endpoint,
    },

    /// The requester wants to drop its link to us; drop the reverse link.
    UnregisterLinkRequest {
        /// The node that is removing the link.
        requester: Endpoint,
    },

    /// Ask for the endpoints the callee is linked to.
    ListLinks,

    /// Roll back to the persisted snapshot `id`: reinstate the links and
    /// state it recorded, and refuse sends and snapshots until
    /// [`RemoteCall::FinishRestore`]. Answered with the restored links.
    RestoreSnapshot {
        /// The node coordinating the restore.
        requester: Endpoint,
        /// The snapshot to restore.
        id: SnapshotId,
    },

    /// End the restore of `id` and replay the in-transit messages it logged.
    FinishRestore {
        /// The node coordinating the restore.
        requester: Endpoint,
        /// The snapshot being restored.
        id: SnapshotId,
    },

    /// Drop the link to `node`, which left the network.
    RemoveNode {
        /// The node reporting the departure.
        requester: Endpoint,
        /// The departed node.
        node: Endpoint,
    },
}

impl RemoteCall {
    /// Short operation name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCall::DeliverMessage { .. } => "deliver_message",
            RemoteCall::DeliverMarker { .. } => "deliver_marker",
            RemoteCall::RegisterLinkBack { .. } => "register_link_back",
            RemoteCall::UnregisterLinkRequest { .. } => "unregister_link_request",
            RemoteCall::ListLinks => "list_links",
            RemoteCall::RestoreSnapshot { .. } => "restore_snapshot",
            RemoteCall::FinishRestore { .. } => "finish_restore",
            RemoteCall::RemoveNode { .. } => "remove_node",
        }
    }
}

/// The answer to a [`RemoteCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteReply {
    /// The call succeeded and carries no result.
    Done,

    /// Result of [`RemoteCall::ListLinks`] and
    /// [`RemoteCall::RestoreSnapshot`].
    Links(Vec<Endpoint>),

    /// The callee rejected the call.
    Error {
        /// Error code for programmatic handling.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl RemoteReply {
    /// Build an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        RemoteReply::Error {
            code,
            message: message.into(),
        }
    }
}

/// Error codes carried in [`RemoteReply::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown/unspecified error.
    Unknown = 0,
    /// The callee has not been initialized, or has stopped.
    NotInitialized = 1,
    /// The caller is not linked to the callee.
    UnknownSender = 2,
    /// A marker for this snapshot already arrived on this channel.
    DuplicateMarker = 3,
    /// The callee has a snapshot in progress and refuses topology changes.
    SnapshotInterrupted = 4,
    /// A link to this endpoint already exists.
    LinkAlreadyPresent = 5,
    /// No link to this endpoint exists.
    LinkNotFound = 6,
    /// The call named the callee itself as the peer.
    SelfLink = 7,
    /// Internal error on the callee.
    InternalError = 8,
    /// The callee is restoring a snapshot.
    RestoreInProgress = 9,
    /// The callee cannot restore the requested snapshot.
    RestoreNotPossible = 10,
}

impl ErrorCode {
    /// Convert to the wire representation.
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parse from the wire representation; unrecognized values map to
    /// [`ErrorCode::Unknown`].
    pub const fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::NotInitialized,
            2 => ErrorCode::UnknownSender,
            3 => ErrorCode::DuplicateMarker,
            4 => ErrorCode::SnapshotInterrupted,
            5 => ErrorCode::LinkAlreadyPresent,
            6 => ErrorCode::LinkNotFound,
            7 => ErrorCode::SelfLink,
            8 => ErrorCode::InternalError,
            9 => ErrorCode::RestoreInProgress,
            10 => ErrorCode::RestoreNotPossible,
            _ => ErrorCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutline_core::{decode, encode};

    #[test]
    fn test_marker_call_survives_cbor() {
        let call = RemoteCall::DeliverMarker {
            sender: Endpoint::new("localhost", 11111),
            initiator: Endpoint::new("localhost", 11113),
            id: SnapshotId(0x0102_0304_0506_0708),
        };
        let back: RemoteCall = decode(&encode(&call).unwrap()).unwrap();
        assert_eq!(back, call);
        assert_eq!(back.name(), "deliver_marker");
    }

    #[test]
    fn test_restore_calls_survive_cbor() {
        let requester = Endpoint::new("localhost", 11111);
        for call in [
            RemoteCall::RestoreSnapshot {
                requester: requester.clone(),
                id: SnapshotId(9),
            },
            RemoteCall::FinishRestore {
                requester: requester.clone(),
                id: SnapshotId(9),
            },
            RemoteCall::RemoveNode {
                requester: requester.clone(),
                node: Endpoint::new("localhost", 11112),
            },
        ] {
            let back: RemoteCall = decode(&encode(&call).unwrap()).unwrap();
            assert_eq!(back, call);
        }
    }

    #[test]
    fn test_error_reply_keeps_code() {
        let reply = RemoteReply::error(ErrorCode::DuplicateMarker, "again");
        let back: RemoteReply = decode(&encode(&reply).unwrap()).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn test_error_code_u16() {
        for code in [
            ErrorCode::NotInitialized,
            ErrorCode::UnknownSender,
            ErrorCode::DuplicateMarker,
            ErrorCode::SnapshotInterrupted,
            ErrorCode::LinkAlreadyPresent,
            ErrorCode::LinkNotFound,
            ErrorCode::SelfLink,
            ErrorCode::InternalError,
            ErrorCode::RestoreInProgress,
            ErrorCode::RestoreNotPossible,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), code);
        }
        assert_eq!(ErrorCode::from_u16(999), ErrorCode::Unknown);
    }
}
