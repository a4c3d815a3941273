//! Error types for the node.

use cutline_core::{CoreError, Endpoint, SnapshotId};
use cutline_net::{ErrorCode, NetError};
use cutline_store::StoreError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node has not been initialized, or has been stopped.
    #[error("node not initialized")]
    NotInitialized,

    /// `init` was called on a node that was already initialized.
    #[error("node already initialized")]
    AlreadyInitialized,

    /// A message or marker came from an endpoint that is not linked.
    #[error("unknown sender: {0}")]
    UnknownSender(Endpoint),

    /// A second marker for the same snapshot arrived on the same channel.
    #[error("duplicate marker for snapshot {id} from {sender}")]
    DuplicateMarker { sender: Endpoint, id: SnapshotId },

    /// A link to the endpoint already exists.
    #[error("link already present: {0}")]
    LinkAlreadyPresent(Endpoint),

    /// No link to the endpoint exists.
    #[error("link not found: {0}")]
    LinkNotFound(Endpoint),

    /// A local topology change was attempted while snapshots are running.
    #[error("topology change forbidden while {running} snapshot(s) are running")]
    ForbiddenWhileSnapshotting { running: usize },

    /// A peer tried to change topology while a snapshot was running on
    /// the side that has to accept the change.
    #[error("snapshot interrupted by topology change from {0}")]
    SnapshotInterrupted(Endpoint),

    /// A snapshot restore is running on this node.
    #[error("snapshot restore in progress")]
    RestoreInProgress,

    /// The snapshot cannot be restored.
    #[error("restore not possible: {0}")]
    RestoreNotPossible(String),

    /// The operation named the local endpoint as its peer.
    #[error("cannot link or send to self: {0}")]
    SelfLink(Endpoint),

    /// A peer rejected the call.
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// The call did not reach the peer, or its reply did not come back.
    #[error("transport error: {0}")]
    Transport(NetError),

    /// Encoding or decoding a state or message failed.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),

    /// The snapshot sink failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl NodeError {
    /// The code this error travels under when it answers a remote call.
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::NotInitialized => ErrorCode::NotInitialized,
            NodeError::UnknownSender(_) => ErrorCode::UnknownSender,
            NodeError::DuplicateMarker { .. } => ErrorCode::DuplicateMarker,
            NodeError::LinkAlreadyPresent(_) => ErrorCode::LinkAlreadyPresent,
            NodeError::LinkNotFound(_) => ErrorCode::LinkNotFound,
            NodeError::SnapshotInterrupted(_) => ErrorCode::SnapshotInterrupted,
            NodeError::SelfLink(_) => ErrorCode::SelfLink,
            NodeError::RestoreInProgress => ErrorCode::RestoreInProgress,
            NodeError::RestoreNotPossible(_) => ErrorCode::RestoreNotPossible,
            NodeError::Remote { code, .. } => *code,
            NodeError::AlreadyInitialized
            | NodeError::ForbiddenWhileSnapshotting { .. }
            | NodeError::Transport(_)
            | NodeError::Codec(_)
            | NodeError::Store(_) => ErrorCode::InternalError,
        }
    }
}

impl From<NetError> for NodeError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Remote { code, message } => NodeError::Remote { code, message },
            NetError::Codec(e) => NodeError::Codec(e),
            other => NodeError::Transport(other),
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
