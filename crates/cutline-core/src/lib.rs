//! # Cutline Core
//!
//! Pure primitives for Cutline: endpoints, snapshot identifiers, snapshot
//! records, and the application state store.
//!
//! This crate contains no networking and no persistence. It is the shared
//! vocabulary of the snapshot engine, the transports, and the sinks.
//!
//! ## Key Types
//!
//! - [`Endpoint`] - `host:port` identity of a node
//! - [`SnapshotId`] - Identifier of one global snapshot, derived from the
//!   initiator endpoint and its local counter
//! - [`SnapshotRecord`] - Local share of a global snapshot: captured state,
//!   topology, and in-transit messages per sender
//! - [`StateStore`] - Deep-copying holder of the current application state
//!
//! ## Encoding
//!
//! Application payloads and state are carried as CBOR bytes. See [`codec`].

pub mod codec;
pub mod error;
pub mod record;
pub mod state;
pub mod types;

pub use codec::{decode, encode, Payload};
pub use error::{CoreError, Result};
pub use record::SnapshotRecord;
pub use state::StateStore;
pub use types::{Endpoint, SnapshotId};
