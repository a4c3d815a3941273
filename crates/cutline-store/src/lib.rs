//! # Cutline Store
//!
//! Persistence sinks for completed snapshot records. A node hands every
//! record it completes to a [`SnapshotSink`]; the sink owns the durable
//! layout.
//!
//! ## Key Types
//!
//! - [`SnapshotSink`] - The async trait every sink implements
//! - [`MemorySink`] - In-memory sink for tests
//! - [`FileSink`] - One directory per snapshot, one file per logged message
//! - [`SqliteSink`] - SQLite-backed sink with versioned migrations
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cutline_store::{FileSink, SnapshotSink};
//!
//! async fn example() {
//!     let sink = FileSink::new("storage_folder/localhost_11111");
//!
//!     // Records arrive from a node as snapshots complete.
//!     // sink.persist(&record).await.unwrap();
//!
//!     let ids = sink.list().await.unwrap();
//!     println!("{} snapshots on disk", ids.len());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Write once**: persisting the same snapshot id twice fails with
//!   [`StoreError::AlreadyExists`]
//! - **Completion order**: [`SnapshotSink::list`] returns ids in the order
//!   they were persisted, so [`SnapshotSink::latest`] is the most recent one

pub mod error;
pub mod fs;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use fs::FileSink;
pub use memory::MemorySink;
pub use sqlite::SqliteSink;
pub use traits::SnapshotSink;
