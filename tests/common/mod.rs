#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use driftsync::config::ReplicatorConfig;
use driftsync::control::StopFlag;
use driftsync::document::Document;
use driftsync::errors::ReplicationError;
use driftsync::namespace::Namespace;
use driftsync::progress::ProgressMap;
use driftsync::sinks::{MemorySink, Sink};
use driftsync::source::{MemorySource, SourceClient};
use driftsync::supervisor::Supervisor;
use tokio::task::JoinHandle;

pub fn ns(name: &str) -> Namespace {
    name.parse().expect("test namespace")
}

pub fn doc_from(value: serde_json::Value) -> Document {
    value.as_object().expect("test document").clone()
}

/// A supervisor running on its own task.
pub struct Running {
    pub stop: StopFlag,
    pub progress: ProgressMap,
    handle: JoinHandle<Result<(), ReplicationError>>,
}

impl Running {
    /// Graceful stop; returns the supervisor's outcome.
    pub async fn stop(self) -> Result<(), ReplicationError> {
        self.stop.stop();
        self.handle.await.expect("supervisor task panicked")
    }

    /// Wait for the supervisor to stop on its own.
    pub async fn wait(self) -> Result<(), ReplicationError> {
        self.handle.await.expect("supervisor task panicked")
    }
}

pub fn launch(
    config: &ReplicatorConfig,
    source: &Arc<MemorySource>,
    sinks: &[Arc<MemorySink>],
) -> Running {
    let dyn_source: Arc<dyn SourceClient> = Arc::clone(source) as Arc<dyn SourceClient>;
    let dyn_sinks: Vec<Arc<dyn Sink>> = sinks
        .iter()
        .map(|sink| Arc::clone(sink) as Arc<dyn Sink>)
        .collect();
    let mut supervisor =
        Supervisor::new(config, dyn_source, dyn_sinks).expect("supervisor construction");
    let stop = supervisor.stop_flag();
    let progress = supervisor.progress();
    let handle = tokio::spawn(async move { supervisor.run().await });
    Running {
        stop,
        progress,
        handle,
    }
}

/// Poll `cond` until it holds. Meant for paused-time tests, where the
/// sleeps auto-advance.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
