//! # Cutline
//!
//! Consistent global snapshots of a network of peer nodes, using the
//! Chandy-Lamport marker protocol.
//!
//! ## Overview
//!
//! Every participant runs a [`Node`]. Nodes are linked pairwise; each link
//! is a pair of FIFO channels. Any node may start a snapshot: it records
//! its own state and sends a marker on every link. A node that sees a
//! marker for the first time records its state and forwards the marker on
//! every link. Until the marker arrives on a channel, messages received on
//! it are logged as in transit. Once a marker has arrived on every link,
//! the node's share of the snapshot is complete and goes to the
//! [`SnapshotSink`](store::SnapshotSink).
//!
//! A persisted snapshot can be restored with
//! [`Node::restore_last_snapshot`]: every node rolls back to the links and
//! state of its record, then replays the messages that were in transit.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cutline::{AppConnector, Endpoint, Node, NodeConfig};
//! use cutline::net::MemoryNetwork;
//! use cutline::store::MemorySink;
//!
//! struct Printer;
//!
//! impl AppConnector<String> for Printer {
//!     fn on_incoming_message(&self, sender: &Endpoint, message: String) {
//!         println!("{sender}: {message}");
//!     }
//! }
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     let node: Node<u64, String> =
//!         Node::new(network.clone(), MemorySink::new(), NodeConfig::default());
//!     node.init("localhost", 11111, Printer).await.unwrap();
//!
//!     // node.add_connection(&Endpoint::new("localhost", 11112)).await?;
//!     node.update_state(&42).unwrap();
//!     let id = node.initiate_snapshot().await.unwrap();
//!     println!("started snapshot {id}");
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `cutline::core` - Endpoints, snapshot ids and records, codec
//! - `cutline::store` - Snapshot sinks (memory, files, SQLite)
//! - `cutline::net` - Remote surface and transports (memory, TCP)

pub mod config;
pub mod error;
pub mod node;

mod engine;
mod lane;
mod ledger;
mod registry;

// Re-export component crates
pub use cutline_core as core;
pub use cutline_net as net;
pub use cutline_store as store;

// Re-export main types for convenience
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{AppConnector, Node, Snapshot, StateHandle};

// Re-export commonly used core types
pub use cutline_core::{Endpoint, SnapshotId, SnapshotRecord};
