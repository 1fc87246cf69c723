//! An in-process source cluster.
//!
//! `MemorySource` stands in for a real document database: per-shard change
//! logs, collections, tailable cursors and primary failover. The test suite
//! drives every replication scenario through it, and embedders can use it
//! for dry runs of sink implementations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;

use crate::document::Document;
use crate::errors::ReplicationError;
use crate::namespace::Namespace;
use crate::oplog::update_spec::{self, UpdatePolicy};
use crate::oplog::LogEntry;
use crate::position::LogPosition;
use crate::source::{
    Credentials, DocumentStream, EntryStream, ShardDescriptor, ShardReader, SourceClient, Topology,
};

struct ShardState {
    descriptor: ShardDescriptor,
    log: Vec<LogEntry>,
    collections: FxHashMap<Namespace, BTreeMap<String, Document>>,
    /// Bumped on failover; open cursors compare against it and die.
    epoch: u64,
}

struct ClusterState {
    topology: Topology,
    shards: Vec<ShardState>,
    last_minted: LogPosition,
    unique_key: String,
}

/// An in-process cluster implementing [`SourceClient`].
pub struct MemorySource {
    inner: Arc<Mutex<ClusterState>>,
    changes: Arc<watch::Sender<u64>>,
}

fn lock_state(inner: &Mutex<ClusterState>) -> MutexGuard<'_, ClusterState> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn canonical_id(id: &Value) -> String {
    id.to_string()
}

impl MemorySource {
    fn with_topology(topology: Topology, shards: Vec<ShardState>) -> Self {
        let (changes, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Mutex::new(ClusterState {
                topology,
                shards,
                last_minted: LogPosition::default(),
                unique_key: "_id".to_string(),
            })),
            changes: Arc::new(changes),
        }
    }

    fn shard_state(id: &str, replica_set: &str, hosts: Vec<String>) -> ShardState {
        ShardState {
            descriptor: ShardDescriptor {
                id: id.to_string(),
                replica_set: replica_set.to_string(),
                hosts,
            },
            log: Vec::new(),
            collections: FxHashMap::default(),
            epoch: 0,
        }
    }

    /// A single replica set exposed as the implicit shard `"0"`.
    pub fn replica_set(set_name: &str) -> Self {
        Self::with_topology(
            Topology::ReplicaSet {
                set_name: set_name.to_string(),
            },
            vec![Self::shard_state(
                "0",
                set_name,
                vec!["memory:27017".to_string()],
            )],
        )
    }

    /// A member that is not part of any replica set. Probing it yields an
    /// empty set name, which the supervisor treats as fatal.
    pub fn standalone() -> Self {
        Self::with_topology(
            Topology::ReplicaSet {
                set_name: String::new(),
            },
            vec![Self::shard_state("0", "", vec!["memory:27017".to_string()])],
        )
    }

    /// A router in front of an initially empty shard catalogue.
    pub fn sharded() -> Self {
        Self::with_topology(Topology::Sharded, Vec::new())
    }

    /// Override the name of the document id field (default `_id`).
    #[must_use]
    pub fn with_unique_key(self, unique_key: &str) -> Self {
        lock_state(&self.inner).unique_key = unique_key.to_string();
        self
    }

    /// Register a shard in the catalogue. New shards are picked up by the
    /// supervisor's periodic re-discovery.
    pub fn add_shard(&self, id: &str, replica_set: &str) {
        {
            let mut state = lock_state(&self.inner);
            let hosts = vec![format!("{replica_set}-0:27017"), format!("{replica_set}-1:27017")];
            state.shards.push(Self::shard_state(id, replica_set, hosts));
        }
        self.bump();
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn mint(state: &mut ClusterState) -> LogPosition {
        let now = LogPosition::now();
        let position = if now > state.last_minted {
            now
        } else {
            state.last_minted.next()
        };
        state.last_minted = position;
        position
    }

    fn with_shard_mut<R>(
        &self,
        shard_id: &str,
        f: impl FnOnce(&mut ClusterState, usize) -> R,
    ) -> R {
        let mut state = lock_state(&self.inner);
        let index = state
            .shards
            .iter()
            .position(|shard| shard.descriptor.id == shard_id)
            .unwrap_or_else(|| panic!("unknown shard {shard_id}"));
        let result = f(&mut state, index);
        drop(state);
        self.bump();
        result
    }

    fn apply_entry(state: &mut ClusterState, shard_index: usize, entry: &LogEntry) {
        let unique_key = state.unique_key.clone();
        let shard = &mut state.shards[shard_index];
        match entry.op {
            crate::oplog::Operation::Insert => {
                if let Value::Object(doc) = &entry.object {
                    if let Some(id) = doc.get(&unique_key) {
                        shard
                            .collections
                            .entry(entry.namespace.clone())
                            .or_default()
                            .insert(canonical_id(id), doc.clone());
                    }
                }
            }
            crate::oplog::Operation::Update => {
                let selector_id = entry
                    .object2
                    .as_ref()
                    .and_then(|selector| selector.get(&unique_key))
                    .cloned();
                if let Some(id) = selector_id {
                    if let Some(doc) = shard
                        .collections
                        .get_mut(&entry.namespace)
                        .and_then(|coll| coll.get_mut(&canonical_id(&id)))
                    {
                        let _ = update_spec::apply_update(
                            doc,
                            &entry.object,
                            &unique_key,
                            UpdatePolicy::ReplaceDocument,
                        );
                    }
                }
            }
            crate::oplog::Operation::Delete => {
                if let Some(id) = entry.object.get(&unique_key) {
                    if let Some(coll) = shard.collections.get_mut(&entry.namespace) {
                        coll.remove(&canonical_id(id));
                    }
                }
            }
            _ => {}
        }
    }

    fn append(&self, shard_id: &str, build: impl FnOnce(LogPosition) -> LogEntry) -> LogPosition {
        self.with_shard_mut(shard_id, |state, index| {
            let position = Self::mint(state);
            let entry = build(position);
            Self::apply_entry(state, index, &entry);
            state.shards[index].log.push(entry);
            position
        })
    }

    /// Insert a document and log the write.
    pub fn insert(&self, shard_id: &str, namespace: &Namespace, doc: Document) -> LogPosition {
        self.append(shard_id, |position| {
            LogEntry::insert(position, namespace.clone(), doc)
        })
    }

    /// Insert produced by the chunk balancer; flagged so tailers drop it.
    pub fn insert_migrated(
        &self,
        shard_id: &str,
        namespace: &Namespace,
        doc: Document,
    ) -> LogPosition {
        self.append(shard_id, |position| {
            LogEntry::insert(position, namespace.clone(), doc).migrated()
        })
    }

    /// Apply an update spec to a stored document and log the write.
    pub fn update(
        &self,
        shard_id: &str,
        namespace: &Namespace,
        id: Value,
        spec: Value,
    ) -> LogPosition {
        let selector_key = lock_state(&self.inner).unique_key.clone();
        self.append(shard_id, |position| {
            let mut selector = Document::new();
            selector.insert(selector_key, id);
            LogEntry::update(position, namespace.clone(), Value::Object(selector), spec)
        })
    }

    /// Delete a stored document and log the write.
    pub fn remove(&self, shard_id: &str, namespace: &Namespace, id: Value) -> LogPosition {
        let selector_key = lock_state(&self.inner).unique_key.clone();
        self.append(shard_id, |position| {
            let mut selector = Document::new();
            selector.insert(selector_key, id);
            LogEntry::delete(position, namespace.clone(), Value::Object(selector))
        })
    }

    /// Log a periodic no-op marker, as the source does on startup.
    pub fn noop(&self, shard_id: &str) -> LogPosition {
        self.append(shard_id, LogEntry::noop)
    }

    /// Log a database command.
    pub fn command(&self, shard_id: &str, database: &str, command: Value) -> LogPosition {
        self.append(shard_id, |position| {
            LogEntry::command(position, database, command)
        })
    }

    /// Seed a collection without logging a write. Used to stage data that an
    /// initial dump should pick up.
    pub fn load_document(&self, shard_id: &str, namespace: &Namespace, doc: Document) {
        self.with_shard_mut(shard_id, |state, index| {
            let unique_key = state.unique_key.clone();
            if let Some(id) = doc.get(&unique_key) {
                let key = canonical_id(id);
                state.shards[index]
                    .collections
                    .entry(namespace.clone())
                    .or_default()
                    .insert(key, doc);
            }
        });
    }

    /// Simulate a primary failover: entries after `keep_through` never made
    /// it to the new primary. Insert effects of the discarded entries are
    /// undone and every open cursor on the shard is invalidated.
    pub fn fail_over(&self, shard_id: &str, keep_through: LogPosition) {
        self.with_shard_mut(shard_id, |state, index| {
            let unique_key = state.unique_key.clone();
            let shard = &mut state.shards[index];
            let discarded: Vec<LogEntry> = shard
                .log
                .iter()
                .filter(|entry| entry.position > keep_through)
                .cloned()
                .collect();
            shard.log.retain(|entry| entry.position <= keep_through);
            for entry in &discarded {
                if entry.op == crate::oplog::Operation::Insert {
                    if let Some(id) = entry.object.get(&unique_key) {
                        if let Some(coll) = shard.collections.get_mut(&entry.namespace) {
                            coll.remove(&canonical_id(id));
                        }
                    }
                }
            }
            shard.epoch += 1;
        });
    }

    /// The newest logged position on a shard.
    pub fn last_position(&self, shard_id: &str) -> Option<LogPosition> {
        let state = lock_state(&self.inner);
        state
            .shards
            .iter()
            .find(|shard| shard.descriptor.id == shard_id)
            .and_then(|shard| shard.log.last().map(|entry| entry.position))
    }

    /// Fetch a stored document, bypassing the reader trait.
    pub fn document(&self, shard_id: &str, namespace: &Namespace, id: &Value) -> Option<Document> {
        let state = lock_state(&self.inner);
        state
            .shards
            .iter()
            .find(|shard| shard.descriptor.id == shard_id)?
            .collections
            .get(namespace)?
            .get(&canonical_id(id))
            .cloned()
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ReplicationError> {
        tracing::debug!(username = %credentials.username, "memory source authenticated");
        Ok(())
    }

    async fn probe(&self) -> Result<Topology, ReplicationError> {
        Ok(lock_state(&self.inner).topology.clone())
    }

    async fn shards(&self) -> Result<Vec<ShardDescriptor>, ReplicationError> {
        Ok(lock_state(&self.inner)
            .shards
            .iter()
            .map(|shard| shard.descriptor.clone())
            .collect())
    }

    async fn shard_reader(
        &self,
        shard: &ShardDescriptor,
    ) -> Result<Arc<dyn ShardReader>, ReplicationError> {
        let state = lock_state(&self.inner);
        if !state.shards.iter().any(|s| s.descriptor.id == shard.id) {
            return Err(ReplicationError::connection(format!(
                "unknown shard {}",
                shard.id
            )));
        }
        Ok(Arc::new(MemoryShardReader {
            shard_id: shard.id.clone(),
            inner: Arc::clone(&self.inner),
            changes: Arc::clone(&self.changes),
        }))
    }
}

struct MemoryShardReader {
    shard_id: String,
    inner: Arc<Mutex<ClusterState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl MemoryShardReader {
    fn with_shard<R>(&self, f: impl FnOnce(&ShardState) -> R) -> Result<R, ReplicationError> {
        let state = lock_state(&self.inner);
        state
            .shards
            .iter()
            .find(|shard| shard.descriptor.id == self.shard_id)
            .map(f)
            .ok_or_else(|| {
                ReplicationError::connection(format!("shard {} is gone", self.shard_id))
            })
    }
}

enum Resume {
    Start,
    Inclusive(LogPosition),
    After(LogPosition),
}

enum CursorStep {
    Yield(LogEntry),
    Dead(ReplicationError),
    Wait,
}

struct Cursor {
    inner: Arc<Mutex<ClusterState>>,
    rx: watch::Receiver<u64>,
    shard_id: String,
    epoch: u64,
    resume: Resume,
    dead: bool,
}

#[async_trait]
impl ShardReader for MemoryShardReader {
    async fn first_position(&self) -> Result<Option<LogPosition>, ReplicationError> {
        self.with_shard(|shard| shard.log.first().map(|entry| entry.position))
    }

    async fn last_position(&self) -> Result<Option<LogPosition>, ReplicationError> {
        self.with_shard(|shard| shard.log.last().map(|entry| entry.position))
    }

    async fn contains_position(&self, position: LogPosition) -> Result<bool, ReplicationError> {
        self.with_shard(|shard| shard.log.iter().any(|entry| entry.position == position))
    }

    async fn tail(&self, from: Option<LogPosition>) -> Result<EntryStream, ReplicationError> {
        let epoch = self.with_shard(|shard| shard.epoch)?;
        let cursor = Cursor {
            inner: Arc::clone(&self.inner),
            rx: self.changes.subscribe(),
            shard_id: self.shard_id.clone(),
            epoch,
            resume: from.map(Resume::Inclusive).unwrap_or(Resume::Start),
            dead: false,
        };
        let stream = stream::unfold(cursor, |mut cursor| async move {
            if cursor.dead {
                return None;
            }
            loop {
                // The lock guard must be released before yielding the
                // cursor state back to the stream or awaiting changes.
                let step = {
                    let state = lock_state(&cursor.inner);
                    let shard = state
                        .shards
                        .iter()
                        .find(|shard| shard.descriptor.id == cursor.shard_id);
                    match shard {
                        None => CursorStep::Dead(ReplicationError::connection(format!(
                            "shard {} is gone",
                            cursor.shard_id
                        ))),
                        Some(shard) if shard.epoch != cursor.epoch => {
                            CursorStep::Dead(ReplicationError::connection(
                                "oplog cursor invalidated by primary change",
                            ))
                        }
                        Some(shard) => {
                            let found = match &cursor.resume {
                                Resume::Start => shard.log.first(),
                                Resume::Inclusive(position) => {
                                    shard.log.iter().find(|entry| entry.position >= *position)
                                }
                                Resume::After(position) => {
                                    shard.log.iter().find(|entry| entry.position > *position)
                                }
                            };
                            match found {
                                Some(entry) => CursorStep::Yield(entry.clone()),
                                None => CursorStep::Wait,
                            }
                        }
                    }
                };
                match step {
                    CursorStep::Yield(entry) => {
                        cursor.resume = Resume::After(entry.position);
                        return Some((Ok(entry), cursor));
                    }
                    CursorStep::Dead(err) => {
                        cursor.dead = true;
                        return Some((Err(err), cursor));
                    }
                    CursorStep::Wait => {
                        // Nothing new; block until the cluster changes.
                        if cursor.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn collections(&self) -> Result<Vec<Namespace>, ReplicationError> {
        self.with_shard(|shard| {
            let mut namespaces: Vec<Namespace> = shard.collections.keys().cloned().collect();
            namespaces.sort();
            namespaces
        })
    }

    async fn scan(&self, namespace: &Namespace) -> Result<DocumentStream, ReplicationError> {
        let docs = self.with_shard(|shard| {
            shard
                .collections
                .get(namespace)
                .map(|coll| coll.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        })?;
        Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
    }

    async fn get_document(
        &self,
        namespace: &Namespace,
        id: &Value,
    ) -> Result<Option<Document>, ReplicationError> {
        self.with_shard(|shard| {
            shard
                .collections
                .get(namespace)
                .and_then(|coll| coll.get(&canonical_id(id)))
                .cloned()
        })
    }
}
