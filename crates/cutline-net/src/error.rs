//! Error types for the net module.

use cutline_core::{CoreError, Endpoint};
use thiserror::Error;

use crate::messages::ErrorCode;

/// Errors that can occur while calling a remote node.
#[derive(Debug, Error)]
pub enum NetError {
    /// Nothing is listening at the endpoint.
    #[error("endpoint unreachable: {0}")]
    Unreachable(Endpoint),

    /// Another node is already bound to the endpoint.
    #[error("endpoint already bound: {0}")]
    AddressInUse(Endpoint),

    /// Connecting took longer than the configured timeout.
    #[error("timeout connecting to {0}")]
    Timeout(Endpoint),

    /// The connection closed before a reply arrived.
    #[error("connection closed")]
    Closed,

    /// A frame exceeded the configured size bound.
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    /// The reply did not match the call.
    #[error("unexpected reply to {call}: {reply}")]
    UnexpectedReply { call: &'static str, reply: String },

    /// The remote node rejected the call.
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// Call or reply failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// The wire error code if the remote node rejected the call.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            NetError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for net operations.
pub type Result<T> = std::result::Result<T, NetError>;
