//! Shard discovery and tailer supervision.
//!
//! The supervisor opens a session to the cluster entry point, loads the
//! checkpoint store into the progress map once, starts one tailer per
//! discovered shard and then loops: flush progress, re-discover shards
//! (sharded mode only) and verify tailer liveness. Any tailer exit tears
//! the whole engine down; the embedding process restarts from the
//! persisted checkpoints.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::ReplicatorConfig;
use crate::control::StopFlag;
use crate::document::FieldProjection;
use crate::errors::ReplicationError;
use crate::namespace::NamespaceConfig;
use crate::progress::{CheckpointStore, ProgressMap};
use crate::sinks::{MemorySink, Sink, SinkRegistry};
use crate::source::{Credentials, ShardDescriptor, SourceClient, Topology};
use crate::tailer::{OplogTailer, TailerSettings, TailerState};

struct TailerHandle {
    shard: ShardDescriptor,
    handle: JoinHandle<Result<(), ReplicationError>>,
    #[allow(dead_code)]
    state: watch::Receiver<TailerState>,
}

/// Discovers shards and supervises one tailer per shard.
pub struct Supervisor {
    main_address: String,
    source: Arc<dyn SourceClient>,
    sinks: Arc<[Arc<dyn Sink>]>,
    store: CheckpointStore,
    progress: ProgressMap,
    namespaces: Arc<NamespaceConfig>,
    projection: FieldProjection,
    settings: TailerSettings,
    credentials: Option<Credentials>,
    stop: StopFlag,
    tailers: FxHashMap<String, TailerHandle>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("main_address", &self.main_address)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build a supervisor from a validated configuration and explicit
    /// sinks. With no sinks configured a single in-memory simulator sink
    /// is used, so a bare setup still exercises the full pipeline.
    pub fn new(
        config: &ReplicatorConfig,
        source: Arc<dyn SourceClient>,
        mut sinks: Vec<Arc<dyn Sink>>,
    ) -> Result<Self, ReplicationError> {
        let store = CheckpointStore::open(&config.checkpoint_path)?;
        let namespaces = Arc::new(config.namespace_config()?);
        if sinks.is_empty() {
            tracing::info!("no sinks configured, using the in-memory simulator");
            sinks.push(MemorySink::new("simulator"));
        }
        Ok(Self {
            main_address: config.main_address.clone(),
            source,
            sinks: sinks.into(),
            store,
            progress: ProgressMap::new(),
            namespaces,
            projection: config.projection(),
            settings: config.tailer_settings(),
            credentials: config.credentials.clone(),
            stop: StopFlag::new(),
            tailers: FxHashMap::default(),
        })
    }

    /// Build a supervisor whose sinks come from the configuration's sink
    /// specs, constructed through the registry. Unknown sink names fail
    /// here, before anything connects.
    pub fn with_registry(
        config: &ReplicatorConfig,
        source: Arc<dyn SourceClient>,
        registry: &SinkRegistry,
    ) -> Result<Self, ReplicationError> {
        let sinks = registry.create_all(&config.sinks, &config.sink_options())?;
        Self::new(config, source, sinks)
    }

    /// The cooperative stop flag. Raising it makes [`run`](Self::run)
    /// return after a graceful teardown.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// The shared progress map, primarily for inspection in tests and
    /// monitoring.
    pub fn progress(&self) -> ProgressMap {
        self.progress.clone()
    }

    /// Run until externally cancelled or a tailer dies.
    #[instrument(skip(self), fields(address = %self.main_address))]
    pub async fn run(&mut self) -> Result<(), ReplicationError> {
        let outcome = self.start_and_supervise().await;
        self.shutdown().await;
        if let Err(err) = &outcome {
            tracing::error!(error = %err, "replication stopped");
        }
        outcome
    }

    async fn start_and_supervise(&mut self) -> Result<(), ReplicationError> {
        if let Some(credentials) = &self.credentials {
            self.source.authenticate(credentials).await?;
        }

        let topology = self.source.probe().await?;
        if let Topology::ReplicaSet { set_name } = &topology {
            if set_name.is_empty() {
                return Err(ReplicationError::operation(format!(
                    "no replica set at {}; a replica set is required to replicate",
                    self.main_address
                )));
            }
            tracing::info!(replica_set = %set_name, "connected to a replica set");
        } else {
            tracing::info!("connected to a sharded cluster router");
        }

        // Load persisted progress exactly once, before any tailer starts.
        let loaded = self.store.load();
        if !loaded.is_empty() {
            tracing::info!(shards = loaded.len(), "loaded prior replication progress");
        }
        self.progress.with_exclusive(|map| {
            for (shard_id, position) in loaded {
                map.insert(shard_id, position);
            }
        });

        self.spawn_missing_tailers().await?;

        loop {
            tokio::select! {
                _ = self.stop.stopped() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            if let Err(err) = self.flush_progress() {
                tracing::warn!(error = %err, "could not persist progress, keeping the previous snapshot");
            }
            if topology == Topology::Sharded {
                self.spawn_missing_tailers().await?;
            }
            if let Some((shard_id, outcome)) = self.reap_dead_tailer().await {
                tracing::error!(shard = %shard_id, "tailer stopped unexpectedly, shutting down");
                return Err(match outcome {
                    Ok(Ok(())) => ReplicationError::operation(format!(
                        "tailer for shard {shard_id} stopped unexpectedly"
                    )),
                    Ok(Err(err)) => err,
                    Err(join_err) => {
                        ReplicationError::operation(format!("tailer task failed: {join_err}"))
                    }
                });
            }
        }
    }

    /// Discover the current shard catalogue and start a tailer for every
    /// shard that does not have one yet.
    async fn spawn_missing_tailers(&mut self) -> Result<(), ReplicationError> {
        let shards = self.source.shards().await?;
        for shard in shards {
            if self.tailers.contains_key(&shard.id) {
                continue;
            }
            let reader = self.source.shard_reader(&shard).await?;
            let tailer = OplogTailer::new(
                shard.clone(),
                reader,
                Arc::clone(&self.sinks),
                self.progress.clone(),
                Arc::clone(&self.namespaces),
                self.projection.clone(),
                self.settings.clone(),
                self.stop.clone(),
            );
            let state = tailer.state_watch();
            tracing::info!(
                shard = %shard.id,
                replica_set = %shard.replica_set,
                "starting tailer"
            );
            let handle = tokio::spawn(tailer.run());
            self.tailers.insert(
                shard.id.clone(),
                TailerHandle {
                    shard,
                    handle,
                    state,
                },
            );
        }
        Ok(())
    }

    async fn reap_dead_tailer(
        &mut self,
    ) -> Option<(String, Result<Result<(), ReplicationError>, tokio::task::JoinError>)> {
        let dead = self
            .tailers
            .iter()
            .find(|(_, tailer)| tailer.handle.is_finished())
            .map(|(shard_id, _)| shard_id.clone())?;
        let tailer = self.tailers.remove(&dead)?;
        Some((dead, tailer.handle.await))
    }

    /// Serialize the progress map under its exclusive section.
    fn flush_progress(&self) -> Result<(), ReplicationError> {
        self.progress.with_exclusive(|map| self.store.save(map))
    }

    /// Graceful stop: raise the flag, join every tailer, flush one last
    /// time, then stop each sink.
    async fn shutdown(&mut self) {
        tracing::info!("stopping all tailers");
        self.stop.stop();
        for (_, tailer) in self.tailers.drain() {
            let shard = tailer.shard.id;
            if let Err(err) = tailer.handle.await {
                tracing::warn!(shard = %shard, error = %err, "tailer task did not join cleanly");
            }
        }
        if let Err(err) = self.flush_progress() {
            tracing::warn!(error = %err, "final progress flush failed");
        }
        for sink in self.sinks.iter() {
            if let Err(err) = sink.stop().await {
                tracing::warn!(sink = sink.name(), error = %err, "sink did not stop cleanly");
            }
        }
    }
}
