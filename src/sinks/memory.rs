//! An in-process sink used by the test suite and as a reference
//! implementation of the contract.
//!
//! Documents are stored id-keyed so repeated upserts of the same document
//! converge on the latest version instead of accumulating near-duplicates.
//! Removed documents leave a tombstone carrying `ns`/`_ts` so rollback
//! search and `get_last_doc` observe deletes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::document::{self, Document, NS_FIELD, TS_FIELD};
use crate::errors::ReplicationError;
use crate::formats::{DefaultDocumentFormatter, DocumentFormatter};
use crate::namespace::Namespace;
use crate::oplog::update_spec::{self, UpdatePolicy};
use crate::position::LogPosition;
use crate::sinks::{AutoCommit, Committer, Sink, SinkOptions};
use crate::source::DocumentStream;

/// Test hook: documents carrying this key fail their upsert.
const FAIL_UPSERT_MARKER: &str = "_fail_upsert";

#[derive(Default)]
struct SinkState {
    docs: FxHashMap<String, Document>,
    removed: FxHashMap<String, Document>,
}

/// An in-memory [`Sink`].
pub struct MemorySink {
    name: String,
    unique_key: String,
    auto_commit: AutoCommit,
    formatter: Arc<dyn DocumentFormatter>,
    state: Mutex<SinkState>,
    committer: Mutex<Option<Committer>>,
    commits: AtomicU64,
}

fn lock_sink(state: &Mutex<SinkState>) -> MutexGuard<'_, SinkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn canonical_id(id: &Value) -> String {
    id.to_string()
}

impl MemorySink {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            unique_key: "_id".to_string(),
            auto_commit: AutoCommit::Never,
            formatter: Arc::new(DefaultDocumentFormatter),
            state: Mutex::new(SinkState::default()),
            committer: Mutex::new(None),
            commits: AtomicU64::new(0),
        })
    }

    /// Registry constructor. Must run inside a tokio runtime when the
    /// auto-commit policy is an interval, because the committer task is
    /// spawned here.
    pub fn from_options(options: &SinkOptions) -> Arc<Self> {
        let name = options
            .url
            .clone()
            .unwrap_or_else(|| "memory".to_string());
        let sink = Arc::new(Self {
            name,
            unique_key: options.unique_key.clone(),
            auto_commit: options.auto_commit,
            formatter: Arc::new(DefaultDocumentFormatter),
            state: Mutex::new(SinkState::default()),
            committer: Mutex::new(None),
            commits: AtomicU64::new(0),
        });
        if let AutoCommit::Interval(secs) = options.auto_commit {
            let committer =
                Committer::spawn(Arc::clone(&sink) as Arc<dyn Sink>, Duration::from_secs(secs));
            *lock_committer(&sink.committer) = Some(committer);
        }
        sink
    }

    /// Every stored document. Not part of the sink contract; mirrors a
    /// match-all query against a real target.
    pub fn all_docs(&self) -> Vec<Document> {
        lock_sink(&self.state).docs.values().cloned().collect()
    }

    /// Fetch one stored document by id.
    pub fn doc(&self, id: &Value) -> Option<Document> {
        lock_sink(&self.state).docs.get(&canonical_id(id)).cloned()
    }

    pub fn len(&self) -> usize {
        lock_sink(&self.state).docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn removed_len(&self) -> usize {
        lock_sink(&self.state).removed.len()
    }

    /// Drop everything, tombstones included.
    pub fn clear(&self) {
        let mut state = lock_sink(&self.state);
        state.docs.clear();
        state.removed.clear();
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

fn lock_committer(slot: &Mutex<Option<Committer>>) -> MutexGuard<'_, Option<Committer>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(
        &self,
        mut doc: Document,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError> {
        if doc.contains_key(FAIL_UPSERT_MARKER) {
            return Err(ReplicationError::operation(format!(
                "injected upsert failure in sink {}",
                self.name
            )));
        }
        document::attach_meta(&mut doc, namespace, position);
        let doc = self.formatter.format_document(&doc);
        let id = doc.get(&self.unique_key).cloned().ok_or_else(|| {
            ReplicationError::operation(format!(
                "document has no {} field, cannot upsert",
                self.unique_key
            ))
        })?;
        {
            let mut state = lock_sink(&self.state);
            let key = canonical_id(&id);
            state.removed.remove(&key);
            state.docs.insert(key, doc);
        }
        if self.auto_commit == AutoCommit::AfterEveryWrite {
            self.commit().await?;
        }
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        mut docs: DocumentStream,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError> {
        let mut count = 0usize;
        while let Some(item) = docs.next().await {
            self.upsert(item?, namespace, position).await?;
            count += 1;
        }
        if count == 0 {
            return Err(ReplicationError::EmptyStream);
        }
        Ok(())
    }

    async fn update(
        &self,
        id: &Value,
        spec: &Value,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<Document, ReplicationError> {
        let mut doc = self.doc(id).ok_or_else(|| {
            ReplicationError::operation(format!("document {id} not present in sink {}", self.name))
        })?;
        update_spec::apply_update(&mut doc, spec, &self.unique_key, UpdatePolicy::ReplaceDocument)?;
        self.upsert(doc.clone(), namespace, position).await?;
        Ok(doc)
    }

    async fn remove(
        &self,
        id: &Value,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError> {
        let mut state = lock_sink(&self.state);
        let key = canonical_id(id);
        state.docs.remove(&key);
        // A tombstone is recorded either way so rollback search still sees
        // the delete; a missing document is not an error.
        let mut tombstone = Document::new();
        tombstone.insert(self.unique_key.clone(), id.clone());
        tombstone.insert(NS_FIELD.to_string(), Value::String(namespace.to_string()));
        tombstone.insert(TS_FIELD.to_string(), Value::from(position.as_i64()));
        state.removed.insert(key, tombstone);
        Ok(())
    }

    async fn search(
        &self,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<DocumentStream, ReplicationError> {
        let state = lock_sink(&self.state);
        let hits: Vec<Document> = state
            .docs
            .values()
            .chain(state.removed.values())
            .filter(|doc| {
                document::document_ts(doc)
                    .map(|ts| ts >= start_ts && ts <= end_ts)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(stream::iter(hits.into_iter().map(Ok)).boxed())
    }

    async fn get_last_doc(&self) -> Result<Option<Document>, ReplicationError> {
        let state = lock_sink(&self.state);
        Ok(state
            .docs
            .values()
            .chain(state.removed.values())
            .max_by_key(|doc| document::document_ts(doc).unwrap_or(i64::MIN))
            .cloned())
    }

    async fn commit(&self) -> Result<(), ReplicationError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ReplicationError> {
        let committer = lock_committer(&self.committer).take();
        if let Some(committer) = committer {
            committer.stop().await;
        }
        Ok(())
    }
}
