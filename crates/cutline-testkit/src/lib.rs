//! # Cutline Testkit
//!
//! Testing utilities for Cutline.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-process clusters of real nodes, a recording
//!   application connector, and scripted fake peers
//! - **Generators**: Proptest strategies for topologies, marker orders and
//!   snapshot records
//!
//! ## Clusters
//!
//! A [`Cluster`] starts nodes on one shared in-memory network, each with
//! its own in-memory sink:
//!
//! ```rust,no_run
//! use cutline_testkit::fixtures::{line, Cluster};
//!
//! # async fn demo() -> cutline::Result<()> {
//! let cluster: Cluster<u64, String> = Cluster::start(3).await?;
//! cluster.link_all(&line(3)).await?;
//! let id = cluster.node(0).initiate_snapshot().await?;
//! assert!(cluster.wait_for_snapshot(id).await);
//! # Ok(())
//! # }
//! ```
//!
//! ## Scripted Peers
//!
//! A [`FakePeer`] answers every call and lets a test send markers and
//! messages to a real node one at a time, so interleavings are exact:
//!
//! ```rust,ignore
//! let peer = FakePeer::bind(&network, endpoint(1)).await?;
//! node.add_connection(peer.endpoint()).await?;
//! peer.send_marker(&local, peer.endpoint(), id).await?;
//! peer.send_message(&local, &"in transit".to_string()).await?;
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cutline_testkit::generators::Topology;
//!
//! proptest! {
//!     #[test]
//!     fn snapshot_completes(topology: Topology) {
//!         // start a cluster, link topology.edges, snapshot, check sinks
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    endpoint, wait_until, wait_until_async, AppEvent, Cluster, FakePeer, Member, RecordingApp,
    BASE_PORT, WAIT,
};
pub use generators::{marker_order, topology, Topology};
