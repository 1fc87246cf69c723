//! The per-shard replication state machine.
//!
//! One `OplogTailer` owns one shard: it seeds the sinks from a collection
//! dump when starting from zero, then tails the shard's change log, filters
//! and transforms each entry, fans it out to every sink and publishes its
//! advancing position into the shared progress map. When the log diverges
//! under it (primary failover, log truncation) it reconciles sink state
//! back to a safe position and resumes.
//!
//! State transitions are driven only by the owning task:
//!
//! ```text
//! init -> dumping  -> tailing <-> rolling_back
//!      \-> tailing            \
//!       \-> stopped            -> stopping -> stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tracing::instrument;

use crate::control::StopFlag;
use crate::document::{self, Document, FieldProjection, NS_FIELD};
use crate::errors::ReplicationError;
use crate::namespace::{Namespace, NamespaceConfig};
use crate::oplog::update_spec::{self, UpdatePolicy};
use crate::oplog::{LogEntry, Operation};
use crate::position::LogPosition;
use crate::progress::ProgressMap;
use crate::retry::{retry_transient, retry_until_ok};
use crate::sinks::Sink;
use crate::source::{ShardDescriptor, ShardReader};

/// Observable lifecycle of a tailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Init,
    Dumping,
    Tailing,
    RollingBack,
    Stopping,
    Stopped,
}

/// Per-tailer knobs, shared by every shard of one supervisor.
#[derive(Debug, Clone)]
pub struct TailerSettings {
    /// Progress publish cadence, in log entries. Also the dump chunk size.
    pub batch_size: usize,
    /// Whether a missing checkpoint triggers an initial collection dump.
    pub collection_dump: bool,
    /// Downgrade dump-time sink failures to warnings.
    pub continue_on_error: bool,
    /// Name of the document id field.
    pub unique_key: String,
    /// Policy for update specs with unsupported operators.
    pub update_policy: UpdatePolicy,
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            collection_dump: true,
            continue_on_error: false,
            unique_key: crate::config::DEFAULT_UNIQUE_KEY.to_string(),
            update_policy: UpdatePolicy::default(),
        }
    }
}

enum Start {
    Tail(LogPosition),
    Dump,
    Empty,
}

/// The per-shard log-tailing state machine.
pub struct OplogTailer {
    shard: ShardDescriptor,
    reader: Arc<dyn ShardReader>,
    sinks: Arc<[Arc<dyn Sink>]>,
    progress: ProgressMap,
    namespaces: Arc<NamespaceConfig>,
    projection: FieldProjection,
    settings: TailerSettings,
    stop: StopFlag,
    state_tx: watch::Sender<TailerState>,
}

impl OplogTailer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: ShardDescriptor,
        reader: Arc<dyn ShardReader>,
        sinks: Arc<[Arc<dyn Sink>]>,
        progress: ProgressMap,
        namespaces: Arc<NamespaceConfig>,
        projection: FieldProjection,
        settings: TailerSettings,
        stop: StopFlag,
    ) -> Self {
        let (state_tx, _) = watch::channel(TailerState::Init);
        Self {
            shard,
            reader,
            sinks,
            progress,
            namespaces,
            projection,
            settings,
            stop,
            state_tx,
        }
    }

    /// Subscribe to state transitions.
    pub fn state_watch(&self) -> watch::Receiver<TailerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: TailerState) {
        tracing::debug!(shard = %self.shard.id, state = ?state, "tailer state");
        let _ = self.state_tx.send(state);
    }

    fn publish(&self, position: LogPosition) {
        self.progress.set(&self.shard.id, position);
    }

    /// Run until cancelled or a fatal error. Consumes the tailer.
    #[instrument(name = "tailer", skip(self), fields(shard = %self.shard.id))]
    pub async fn run(self) -> Result<(), ReplicationError> {
        let result = self.drive().await;
        self.set_state(TailerState::Stopping);
        match &result {
            Ok(()) => tracing::info!(shard = %self.shard.id, "tailer stopped"),
            Err(err) => tracing::error!(shard = %self.shard.id, error = %err, "tailer failed"),
        }
        self.set_state(TailerState::Stopped);
        result
    }

    async fn drive(&self) -> Result<(), ReplicationError> {
        match self.startup().await? {
            Start::Tail(checkpoint) => self.tail_loop(checkpoint).await,
            Start::Dump => match self.dump().await? {
                Some(checkpoint) => self.tail_loop(checkpoint).await,
                // Cancelled mid-dump: nothing was checkpointed, the next
                // run re-dumps from scratch.
                None => Ok(()),
            },
            Start::Empty => {
                tracing::info!(
                    shard = %self.shard.id,
                    "log is empty and no checkpoint exists, nothing to replicate"
                );
                Ok(())
            }
        }
    }

    /// Decide where to start from: a prior checkpoint, an initial dump, or
    /// nowhere at all.
    async fn startup(&self) -> Result<Start, ReplicationError> {
        if let Some(checkpoint) = self.progress.get(&self.shard.id) {
            tracing::info!(shard = %self.shard.id, checkpoint = %checkpoint, "resuming from checkpoint");
            return Ok(Start::Tail(checkpoint));
        }
        match self.reader.last_position().await? {
            None => Ok(Start::Empty),
            Some(_) if self.settings.collection_dump => Ok(Start::Dump),
            Some(last) => {
                // Dump disabled: skip history and tail from the log's end.
                self.publish(last);
                Ok(Start::Tail(last))
            }
        }
    }

    // ------------------------------------------------------------------
    // Initial dump
    // ------------------------------------------------------------------

    /// Seed the sinks from a full collection scan. The checkpoint is the
    /// log position observed *before* the first read, so writes landing
    /// during the dump are replayed afterwards; sinks are idempotent.
    async fn dump(&self) -> Result<Option<LogPosition>, ReplicationError> {
        self.set_state(TailerState::Dumping);
        let dump_start = self.reader.last_position().await?.ok_or_else(|| {
            ReplicationError::operation("change log emptied before the dump started")
        })?;
        tracing::info!(
            shard = %self.shard.id,
            dump_start = %dump_start,
            "seeding sinks from a collection dump"
        );

        let collections = self.reader.collections().await?;
        'collections: for namespace in collections {
            if !self.namespaces.allows(&namespace) {
                continue;
            }
            let destination = self.namespaces.rename(&namespace);
            let mut scan = self.reader.scan(&namespace).await?;
            let mut chunk: Vec<Document> = Vec::with_capacity(self.settings.batch_size);
            loop {
                let item = tokio::select! {
                    _ = self.stop.stopped() => break 'collections,
                    item = scan.next() => item,
                };
                match item {
                    Some(Ok(mut doc)) => {
                        document::attach_meta(&mut doc, &destination, dump_start);
                        self.projection.apply(&mut doc, &self.settings.unique_key);
                        chunk.push(doc);
                        if chunk.len() >= self.settings.batch_size {
                            self.flush_chunk(&destination, &mut chunk, dump_start).await?;
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => break,
                }
            }
            if !chunk.is_empty() {
                self.flush_chunk(&destination, &mut chunk, dump_start).await?;
            }
        }

        if self.stop.is_stopped() {
            tracing::info!(shard = %self.shard.id, "dump cancelled, discarding partial progress");
            return Ok(None);
        }
        self.publish(dump_start);
        Ok(Some(dump_start))
    }

    async fn flush_chunk(
        &self,
        destination: &Namespace,
        chunk: &mut Vec<Document>,
        position: LogPosition,
    ) -> Result<(), ReplicationError> {
        let docs = std::mem::take(chunk);
        for sink in self.sinks.iter() {
            let stream = futures_util::stream::iter(docs.clone().into_iter().map(Ok)).boxed();
            match sink.bulk_upsert(stream, destination, position).await {
                Ok(()) | Err(ReplicationError::EmptyStream) => {}
                Err(err) if self.settings.continue_on_error => {
                    tracing::warn!(
                        sink = sink.name(),
                        namespace = %destination,
                        count = docs.len(),
                        error = %err,
                        "bulk upsert failed, skipping batch"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tailing
    // ------------------------------------------------------------------

    async fn tail_loop(&self, start: LogPosition) -> Result<(), ReplicationError> {
        self.set_state(TailerState::Tailing);
        let mut checkpoint = start;
        let mut since_publish = 0usize;
        // Set right after reconciliation. The safe position may predate the
        // new primary's oldest entry, so the next cursor's head is allowed
        // to be strictly newer than the checkpoint.
        let mut resumed_after_rollback = false;

        'cursor: loop {
            if self.stop.is_stopped() {
                break;
            }

            // Re-query the log for the checkpointed entry; its absence is
            // the divergence signal (primary change, log truncation, an
            // actual rollback).
            let present = match retry_until_ok(&self.stop, || {
                self.reader.contains_position(checkpoint)
            })
            .await
            {
                Some(present) => present,
                None => break,
            };
            if !present && !resumed_after_rollback {
                let log_tail = self.reader.last_position().await.unwrap_or(None);
                if log_tail.is_none() {
                    // An empty log proves nothing; wait for the primary to
                    // write something before deciding.
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
                let divergence = ReplicationError::LogDivergence {
                    shard: self.shard.id.clone(),
                    checkpoint,
                };
                tracing::warn!(error = %divergence, "log rewritten under the tailer");
                checkpoint = self.reconcile(checkpoint).await?;
                since_publish = 0;
                resumed_after_rollback = true;
                continue;
            }

            let cursor = retry_until_ok(&self.stop, || self.reader.tail(Some(checkpoint))).await;
            let Some(mut entries) = cursor else { break };

            // The cursor starts at the checkpoint itself. A matching head
            // is the entry already applied before the checkpoint was
            // persisted; it is discarded so resumption applies strictly
            // newer entries.
            let head = tokio::select! {
                _ = self.stop.stopped() => break 'cursor,
                head = entries.next() => head,
            };
            match head {
                Some(Ok(entry)) if entry.position == checkpoint => {
                    resumed_after_rollback = false;
                }
                Some(Ok(entry)) if resumed_after_rollback && entry.position > checkpoint => {
                    // Nothing survives at the reconciled position itself;
                    // the first newer entry is real work.
                    resumed_after_rollback = false;
                    let position = entry.position;
                    self.process_entry(entry).await?;
                    checkpoint = position;
                    since_publish += 1;
                }
                Some(Ok(entry)) => {
                    tracing::warn!(
                        checkpoint = %checkpoint,
                        head = %entry.position,
                        "log head moved past the checkpoint, re-checking"
                    );
                    continue 'cursor;
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "oplog cursor lost before the first entry");
                    continue 'cursor;
                }
                None => continue 'cursor,
            }

            loop {
                // Prefer draining ready entries; once the cursor would
                // block, publish the position and then wait.
                let item = match entries.next().now_or_never() {
                    Some(item) => item,
                    None => {
                        if since_publish > 0 {
                            self.publish(checkpoint);
                            since_publish = 0;
                        }
                        tokio::select! {
                            _ = self.stop.stopped() => break 'cursor,
                            item = entries.next() => item,
                        }
                    }
                };
                match item {
                    Some(Ok(entry)) => {
                        let position = entry.position;
                        self.process_entry(entry).await?;
                        checkpoint = position;
                        since_publish += 1;
                        if since_publish >= self.settings.batch_size {
                            self.publish(checkpoint);
                            since_publish = 0;
                        }
                    }
                    Some(Err(err)) => {
                        // Cursor invalidated; the divergence re-query at
                        // the top of the loop decides what happens next.
                        tracing::warn!(shard = %self.shard.id, error = %err, "oplog cursor invalidated");
                        if since_publish > 0 {
                            self.publish(checkpoint);
                            since_publish = 0;
                        }
                        continue 'cursor;
                    }
                    None => {
                        if since_publish > 0 {
                            self.publish(checkpoint);
                            since_publish = 0;
                        }
                        tracing::debug!(shard = %self.shard.id, "oplog cursor ended, re-establishing");
                        tokio::select! {
                            _ = self.stop.stopped() => break 'cursor,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue 'cursor;
                    }
                }
            }
        }

        if since_publish > 0 {
            self.publish(checkpoint);
        }
        Ok(())
    }

    async fn process_entry(&self, entry: LogEntry) -> Result<(), ReplicationError> {
        // Chunk balancer traffic was already applied on the receiving
        // shard; re-applying it would duplicate writes.
        if entry.from_migrate {
            return Ok(());
        }
        if !self.namespaces.allows(&entry.namespace) {
            return Ok(());
        }
        let destination = self.namespaces.rename(&entry.namespace);

        match entry.op {
            Operation::Insert => {
                let Value::Object(mut doc) = entry.object else {
                    tracing::warn!(position = %entry.position, "insert entry without a document payload");
                    return Ok(());
                };
                document::attach_meta(&mut doc, &destination, entry.position);
                self.projection.apply(&mut doc, &self.settings.unique_key);
                self.fan_out_upsert(doc, &destination, entry.position).await;
            }
            Operation::Update => {
                let id = entry
                    .object2
                    .as_ref()
                    .and_then(|selector| selector.get(&self.settings.unique_key))
                    .cloned();
                let Some(id) = id else {
                    tracing::warn!(position = %entry.position, "update entry without a selector id");
                    return Ok(());
                };
                let fetched = retry_until_ok(&self.stop, || {
                    self.reader.get_document(&entry.namespace, &id)
                })
                .await;
                let Some(fetched) = fetched else { return Ok(()) };
                let Some(mut doc) = fetched else {
                    // Deleted again after this update; the delete entry
                    // behind us will reach the sinks on its own.
                    tracing::debug!(position = %entry.position, id = %id, "post-image gone, skipping update");
                    return Ok(());
                };
                if let Err(err) = update_spec::apply_update(
                    &mut doc,
                    &entry.object,
                    &self.settings.unique_key,
                    self.settings.update_policy,
                ) {
                    tracing::warn!(position = %entry.position, id = %id, error = %err, "update spec rejected");
                    return Ok(());
                }
                document::attach_meta(&mut doc, &destination, entry.position);
                self.projection.apply(&mut doc, &self.settings.unique_key);
                self.fan_out_upsert(doc, &destination, entry.position).await;
            }
            Operation::Delete => {
                let Some(id) = entry.object.get(&self.settings.unique_key).cloned() else {
                    tracing::warn!(position = %entry.position, "delete entry without an id");
                    return Ok(());
                };
                for sink in self.sinks.iter() {
                    let outcome =
                        retry_transient(&self.stop, || sink.remove(&id, &destination, entry.position))
                            .await;
                    match outcome {
                        None => return Ok(()),
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            tracing::warn!(sink = sink.name(), id = %id, error = %err, "delete failed, continuing");
                        }
                    }
                }
            }
            Operation::Command => {
                for sink in self.sinks.iter() {
                    if !sink.supports_commands() {
                        tracing::debug!(
                            sink = sink.name(),
                            namespace = %destination,
                            "sink does not handle commands, ignoring"
                        );
                        continue;
                    }
                    if let Err(err) = sink
                        .handle_command(&entry.object, &destination, entry.position)
                        .await
                    {
                        tracing::warn!(sink = sink.name(), error = %err, "command failed, continuing");
                    }
                }
            }
            Operation::Noop => {}
        }
        Ok(())
    }

    /// Dispatch one upsert to every sink in declaration order. Transient
    /// failures are retried until cancelled; semantic failures are logged
    /// and tailing continues.
    async fn fan_out_upsert(&self, doc: Document, destination: &Namespace, position: LogPosition) {
        for sink in self.sinks.iter() {
            let outcome =
                retry_transient(&self.stop, || sink.upsert(doc.clone(), destination, position))
                    .await;
            match outcome {
                None => return,
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::warn!(
                        sink = sink.name(),
                        namespace = %destination,
                        error = %err,
                        "sink write failed, continuing"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Rollback reconciliation
    // ------------------------------------------------------------------

    /// The checkpointed position no longer exists in the log: writes from
    /// the old primary were rolled back. Purge from every sink whatever is
    /// newer than the position both the sinks and the new primary agree on,
    /// then resume from there.
    async fn reconcile(&self, checkpoint: LogPosition) -> Result<LogPosition, ReplicationError> {
        self.set_state(TailerState::RollingBack);
        tracing::warn!(
            shard = %self.shard.id,
            checkpoint = %checkpoint,
            "log diverged, reconciling sink state"
        );

        let mut sink_tops: Vec<Option<i64>> = Vec::with_capacity(self.sinks.len());
        for sink in self.sinks.iter() {
            let last = sink.get_last_doc().await?;
            sink_tops.push(last.as_ref().and_then(document::document_ts));
        }

        // When the sinks disagree the smallest top wins; purging down to it
        // at every sink is harmless because re-tailing replays the gap.
        let Some(t_sink) = sink_tops.iter().flatten().copied().min() else {
            let tail = self.reader.last_position().await?.unwrap_or(checkpoint);
            tracing::info!(shard = %self.shard.id, resume = %tail, "sinks are empty, treating shard as fresh");
            self.publish(tail);
            self.set_state(TailerState::Tailing);
            return Ok(tail);
        };

        let first_new = self.reader.first_position().await?;
        let t_safe_raw = match first_new {
            Some(first) => t_sink.min(first.as_i64()),
            None => t_sink,
        };
        let t_safe = LogPosition::from_i64(t_safe_raw);

        for (sink, top) in self.sinks.iter().zip(&sink_tops) {
            let Some(top) = top else { continue };
            let mut hits = sink.search(t_safe_raw, *top).await?;
            while let Some(item) = hits.next().await {
                let doc = match item {
                    Ok(doc) => doc,
                    Err(err) => {
                        tracing::warn!(sink = sink.name(), error = %err, "rollback search item failed");
                        continue;
                    }
                };
                let Some(id) = document::document_id(&doc, &self.settings.unique_key).cloned()
                else {
                    continue;
                };
                let namespace = doc
                    .get(NS_FIELD)
                    .and_then(Value::as_str)
                    .and_then(|ns| ns.parse::<Namespace>().ok());
                let Some(namespace) = namespace else { continue };
                let position = document::document_ts(&doc)
                    .map(LogPosition::from_i64)
                    .unwrap_or(t_safe);
                let outcome =
                    retry_transient(&self.stop, || sink.remove(&id, &namespace, position)).await;
                match outcome {
                    // Cancelled mid-purge: leave the checkpoint untouched
                    // so the next run redoes the reconciliation.
                    None => return Ok(t_safe),
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        tracing::warn!(sink = sink.name(), id = %id, error = %err, "rollback purge failed");
                    }
                }
            }
        }

        self.publish(t_safe);
        tracing::info!(shard = %self.shard.id, resume = %t_safe, "rollback reconciliation complete");
        self.set_state(TailerState::Tailing);
        Ok(t_safe)
    }
}
