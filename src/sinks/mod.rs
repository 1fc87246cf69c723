//! The sink contract and the static sink registry.
//!
//! A sink is the target-side adapter receiving replicated changes. Every
//! operation must be idempotent under replay: the engine guarantees
//! at-least-once delivery per shard, never exactly-once. Sinks are called
//! concurrently from distinct tailers and must be thread-safe.

mod committer;
mod memory;

pub use committer::Committer;
pub use memory::MemorySink;

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::document::Document;
use crate::errors::{ConfigError, ReplicationError};
use crate::namespace::Namespace;
use crate::position::LogPosition;
use crate::source::DocumentStream;

/// How often a sink makes its writes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoCommit {
    /// Never explicitly commit; the target's own refresh policy applies.
    #[default]
    Never,
    /// Commit after every write.
    AfterEveryWrite,
    /// Run a background committer every `k` seconds.
    Interval(u64),
}

impl AutoCommit {
    /// Parse the configured `auto-commit-interval`: unset means never,
    /// zero means per-write, anything else is a background interval.
    pub fn from_secs(interval: Option<u64>) -> Self {
        match interval {
            None => AutoCommit::Never,
            Some(0) => AutoCommit::AfterEveryWrite,
            Some(secs) => AutoCommit::Interval(secs),
        }
    }
}

/// The target adapter contract.
///
/// Error discipline: transport-level failures should surface as
/// [`ReplicationError::ConnectionFailed`] so the engine retries them;
/// anything else is treated as a semantic failure and handled by the
/// caller's error policy (`continue-on-error` during dumps, log-and-go
/// while tailing).
#[async_trait]
pub trait Sink: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    /// Insert or replace a single document. The document carries its id
    /// under the configured unique key; `ns` and `position` become the
    /// `ns`/`_ts` metadata.
    async fn upsert(
        &self,
        doc: Document,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError>;

    /// Insert or replace a finite stream of documents. An empty stream is
    /// reported as [`ReplicationError::EmptyStream`], which callers
    /// tolerate silently.
    async fn bulk_upsert(
        &self,
        docs: DocumentStream,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError>;

    /// Apply an update spec directly at the target. Optional: the default
    /// refuses, which makes the tailer resolve the post-image from the
    /// source and upsert it instead.
    async fn update(
        &self,
        id: &Value,
        spec: &Value,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<Document, ReplicationError> {
        let _ = (id, spec, namespace, position);
        Err(ReplicationError::operation(format!(
            "sink {} does not apply updates in place",
            self.name()
        )))
    }

    /// Remove a document by id. A missing document is not an error.
    async fn remove(
        &self,
        id: &Value,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError>;

    /// Stream every document whose `_ts` lies in the inclusive range.
    /// Used only during rollback reconciliation.
    async fn search(
        &self,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<DocumentStream, ReplicationError>;

    /// The document with the greatest `_ts`, or `None` on a fresh target.
    async fn get_last_doc(&self) -> Result<Option<Document>, ReplicationError>;

    /// Synchronously flush pending writes.
    async fn commit(&self) -> Result<(), ReplicationError>;

    /// Release resources, including any background committer.
    async fn stop(&self) -> Result<(), ReplicationError>;

    /// Whether [`handle_command`](Self::handle_command) does anything.
    fn supports_commands(&self) -> bool {
        false
    }

    /// Apply a database command (drop collection, drop database, rename).
    /// Sinks that do not support a command log and ignore it.
    async fn handle_command(
        &self,
        command: &Value,
        namespace: &Namespace,
        position: LogPosition,
    ) -> Result<(), ReplicationError> {
        let _ = position;
        tracing::info!(
            sink = self.name(),
            namespace = %namespace,
            command = %command,
            "sink does not support commands, ignoring"
        );
        Ok(())
    }
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").field("name", &self.name()).finish()
    }
}

/// One configured sink: a registered type name and its optional target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSpec {
    pub name: String,
    pub url: Option<String>,
}

/// Pair sink names with target URLs.
///
/// URLs are assigned to names in order. Extra names get no URL; extra URLs
/// share the last named sink type. URLs without any sink name at all are a
/// configuration error.
pub fn pair_sinks(names: &[String], urls: &[String]) -> Result<Vec<SinkSpec>, ConfigError> {
    if names.is_empty() {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        return Err(ConfigError::TargetUrlWithoutSink);
    }
    let count = names.len().max(urls.len());
    let last_name = &names[names.len() - 1];
    let mut specs = Vec::with_capacity(count);
    for index in 0..count {
        let name = names.get(index).unwrap_or(last_name).clone();
        let url = urls.get(index).cloned();
        specs.push(SinkSpec { name, url });
    }
    Ok(specs)
}

/// Options handed to every sink constructor.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub url: Option<String>,
    pub unique_key: String,
    pub auto_commit: AutoCommit,
}

/// A sink constructor.
pub type SinkFactory = fn(&SinkOptions) -> Result<Arc<dyn Sink>, ReplicationError>;

/// Compile-time map from sink name to constructor.
///
/// The configuration names sinks by string; unknown names fail at startup.
/// Embedders register additional sinks before building the supervisor.
pub struct SinkRegistry {
    factories: FxHashMap<String, SinkFactory>,
}

impl SinkRegistry {
    /// The registry with the built-in sinks: currently only `memory`.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: FxHashMap::default(),
        };
        registry.register("memory", |options| {
            Ok(MemorySink::from_options(options) as Arc<dyn Sink>)
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: SinkFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Construct one sink; unknown names are a startup failure.
    pub fn create(
        &self,
        spec: &SinkSpec,
        options: &SinkOptions,
    ) -> Result<Arc<dyn Sink>, ReplicationError> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| ConfigError::UnknownSink {
                name: spec.name.clone(),
            })?;
        let mut options = options.clone();
        options.url = spec.url.clone();
        factory(&options)
    }

    /// Construct every configured sink in declaration order.
    pub fn create_all(
        &self,
        specs: &[SinkSpec],
        options: &SinkOptions,
    ) -> Result<Vec<Arc<dyn Sink>>, ReplicationError> {
        specs.iter().map(|spec| self.create(spec, options)).collect()
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
