//! The source-database seam.
//!
//! The engine never talks to a concrete database driver directly: the
//! supervisor discovers the cluster through a [`SourceClient`] and each
//! tailer reads one shard's primary through a [`ShardReader`]. The crate
//! ships an in-process implementation ([`MemorySource`]) used by the test
//! suite and for dry runs.

mod memory;

pub use memory::MemorySource;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::document::Document;
use crate::errors::ReplicationError;
use crate::namespace::Namespace;
use crate::oplog::LogEntry;
use crate::position::LogPosition;

/// A tailable stream of change-log entries. The stream blocks awaiting new
/// entries instead of ending; it yields an error when the cursor is
/// invalidated (primary change, log truncation).
pub type EntryStream = BoxStream<'static, Result<LogEntry, ReplicationError>>;

/// A finite stream of documents, as produced by a collection scan.
pub type DocumentStream = BoxStream<'static, Result<Document, ReplicationError>>;

/// One shard of the source cluster. Unsharded replicated deployments expose
/// a single implicit shard with id `"0"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub id: String,
    pub replica_set: String,
    pub hosts: Vec<String>,
}

impl ShardDescriptor {
    /// Parse a router catalogue `host` field of the form
    /// `replica-set/host,host,...`. Entries without a replica-set prefix are
    /// rejected: the engine only replicates from replica sets.
    pub fn from_catalogue_entry(id: &str, host_field: &str) -> Result<Self, ReplicationError> {
        let (replica_set, hosts) = host_field.split_once('/').ok_or_else(|| {
            ReplicationError::operation(format!(
                "shard {id} is not backed by a replica set: {host_field}"
            ))
        })?;
        Ok(Self {
            id: id.to_string(),
            replica_set: replica_set.to_string(),
            hosts: hosts.split(',').map(str::to_string).collect(),
        })
    }
}

/// What kind of entry point the supervisor connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// A router in front of a sharded cluster; shards are enumerated from
    /// its catalogue and re-discovered while running.
    Sharded,
    /// A member of a single replica set. An empty `set_name` means the
    /// member is not part of a replica set, which is fatal.
    ReplicaSet { set_name: String },
}

/// Credentials for the optional admin authentication step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A session with the cluster entry point.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Authenticate the session. Called once before discovery when
    /// credentials are configured.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ReplicationError>;

    /// Probe whether the entry point is a router or a replica-set member.
    async fn probe(&self) -> Result<Topology, ReplicationError>;

    /// Enumerate the current shard catalogue.
    async fn shards(&self) -> Result<Vec<ShardDescriptor>, ReplicationError>;

    /// Open a connection to the shard's primary.
    async fn shard_reader(
        &self,
        shard: &ShardDescriptor,
    ) -> Result<Arc<dyn ShardReader>, ReplicationError>;
}

/// A connection to one shard's primary: its change log and collections.
#[async_trait]
pub trait ShardReader: Send + Sync {
    /// The oldest position still present in the shard's log.
    async fn first_position(&self) -> Result<Option<LogPosition>, ReplicationError>;

    /// The newest position in the shard's log.
    async fn last_position(&self) -> Result<Option<LogPosition>, ReplicationError>;

    /// Whether an entry at exactly `position` still exists in the log.
    async fn contains_position(&self, position: LogPosition) -> Result<bool, ReplicationError>;

    /// Open a tailable cursor. With `from` set, the first yielded entry is
    /// the one at `from` when it still exists, otherwise the oldest entry
    /// newer than `from`; the caller decides what a missing head means.
    async fn tail(&self, from: Option<LogPosition>) -> Result<EntryStream, ReplicationError>;

    /// The collections currently present on this shard.
    async fn collections(&self) -> Result<Vec<Namespace>, ReplicationError>;

    /// Stream every document of a collection.
    async fn scan(&self, namespace: &Namespace) -> Result<DocumentStream, ReplicationError>;

    /// Fetch a single document by id, used to resolve update post-images.
    async fn get_document(
        &self,
        namespace: &Namespace,
        id: &Value,
    ) -> Result<Option<Document>, ReplicationError>;
}
