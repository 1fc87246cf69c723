//! # driftsync: change replication into search sinks
//!
//! driftsync continuously replicates changes from a sharded or replicated
//! document database into one or more external search/index backends. It
//! tails the per-shard change log, transforms observed operations into
//! sink-side upserts and deletes, and advances durable checkpoints so
//! replication resumes where it left off after a restart. When a primary
//! failover rewrites the source log, the engine detects the divergence and
//! reconciles sink state back to a safe position.
//!
//! ## Core Concepts
//!
//! - **Supervisor**: discovers shards, spawns one tailer per shard, and
//!   flushes progress to the checkpoint store once a second
//! - **Tailer**: the per-shard state machine (dump, tail, roll back)
//! - **Sink**: the target adapter contract; every sink operation is
//!   idempotent under replay
//! - **Progress map / checkpoint store**: in-memory and on-disk views of
//!   the last applied log position per shard
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync::config::ReplicatorConfig;
//! use driftsync::sinks::{MemorySink, Sink};
//! use driftsync::source::MemorySource;
//! use driftsync::supervisor::Supervisor;
//!
//! # async fn example() -> Result<(), driftsync::errors::ReplicationError> {
//! let config = ReplicatorConfig::builder("localhost:27017", "progress.json")
//!     .namespace_set(["app.events"])
//!     .build()?;
//!
//! let source = Arc::new(MemorySource::replica_set("rs0"));
//! let sinks: Vec<Arc<dyn Sink>> = vec![MemorySink::new("primary")];
//!
//! let mut supervisor = Supervisor::new(&config, source, sinks)?;
//! supervisor.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Delivery is at-least-once per shard: events reach each sink in strictly
//! increasing log-position order within a shard, and a sink may see the same
//! event again after a restart. No ordering is promised across shards.
//!
//! ## Module Guide
//!
//! - [`position`] - Opaque, totally ordered per-shard log positions
//! - [`namespace`] - Qualified names, the include filter and the rename map
//! - [`oplog`] - Log entry model and update-operator application
//! - [`source`] - The source-database seam and the in-memory cluster
//! - [`sinks`] - The sink contract, registry, committer and simulator sink
//! - [`formats`] - Document formatters invoked by sinks
//! - [`progress`] - Progress map and the durable checkpoint file
//! - [`tailer`] - The per-shard replication state machine
//! - [`supervisor`] - Shard discovery, tailer supervision, progress flushing

pub mod config;
pub mod control;
pub mod document;
pub mod errors;
pub mod formats;
pub mod namespace;
pub mod oplog;
pub mod position;
pub mod progress;
pub mod retry;
pub mod sinks;
pub mod source;
pub mod supervisor;
pub mod tailer;
pub mod telemetry;
