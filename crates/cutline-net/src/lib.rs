//! # Cutline Net
//!
//! The operations one node invokes on another, and the transports that
//! carry them.
//!
//! ## Overview
//!
//! A node exposes five remote operations to its peers. The outbound side is
//! the [`RemoteNode`] trait, available on every [`Connection`]; the inbound
//! side is a [`CallHandler`] bound to a local endpoint through a
//! [`Transport`].
//!
//! | Operation | Failure signals |
//! |---|---|
//! | `deliver_message` | `UnknownSender` |
//! | `deliver_marker` | `UnknownSender`, `DuplicateMarker` |
//! | `register_link_back` | none |
//! | `unregister_link_request` | `SnapshotInterrupted` |
//! | `list_links` | none |
//!
//! Any call may also fail with a transport error.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cutline_core::Endpoint;
//! use cutline_net::{MemoryNetwork, RemoteNode, Transport};
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     // network.bind(&me, handler).await?;
//!
//!     let peer = network.connect(&Endpoint::new("localhost", 11112)).await.unwrap();
//!     let links = peer.list_links().await.unwrap();
//!     println!("peer has {} links", links.len());
//! }
//! ```
//!
//! ## Ordering
//!
//! ```text
//! Node A                                Node B
//!   |-- DeliverMessage(m1) ------------->|
//!   |<------------------------- Done ----|
//!   |-- DeliverMarker(id) -------------->|
//!   |<------------------------- Done ----|
//! ```
//!
//! A caller that waits for each reply before the next call gets FIFO
//! delivery on that channel from every transport in this crate.

pub mod error;
pub mod frame;
pub mod messages;
pub mod tcp;
pub mod transport;

pub use error::{NetError, Result};
pub use messages::{ErrorCode, RemoteCall, RemoteReply};
pub use tcp::{TcpConfig, TcpConnection, TcpTransport};
pub use transport::{
    memory::MemoryConnection, memory::MemoryNetwork, CallHandler, Connection, RemoteHandle,
    RemoteNode, Transport,
};
