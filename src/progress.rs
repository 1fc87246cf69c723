//! Replication progress: the shared in-memory map and its durable file.
//!
//! Tailers publish their advancing positions into the [`ProgressMap`]; the
//! supervisor periodically serializes the map to the [`CheckpointStore`].
//! Serialization happens under the map's exclusive section so no tailer
//! writes mid-snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::errors::{ConfigError, ReplicationError};
use crate::position::LogPosition;

/// The in-memory mirror of the checkpoint store: shard id to last applied
/// position.
///
/// The stored position for a shard is always at or before the last position
/// whose effect every configured sink has acknowledged. Each entry is
/// mutated only by its owning tailer; the whole map is read by the
/// supervisor under [`with_exclusive`](Self::with_exclusive).
#[derive(Clone, Debug, Default)]
pub struct ProgressMap {
    inner: Arc<Mutex<FxHashMap<String, LogPosition>>>,
}

impl ProgressMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, LogPosition>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, shard_id: &str) -> Option<LogPosition> {
        self.lock().get(shard_id).copied()
    }

    pub fn set(&self, shard_id: &str, position: LogPosition) {
        self.lock().insert(shard_id.to_string(), position);
    }

    /// Run `f` with exclusive access to the whole map. Held across
    /// checkpoint serialization.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut FxHashMap<String, LogPosition>) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

/// The durable checkpoint file.
///
/// Format: a flat JSON array alternating shard id strings and packed i64
/// positions, `["0", 123, "1", 456]`. An empty or missing file means no
/// prior progress. Writes rotate a `.backup` sibling so a failed write
/// never destroys the previous snapshot.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Open the store, creating an empty file when none exists. An
    /// uncreatable or unwritable path is fatal at startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no checkpoint file, creating an empty one");
        }
        fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|err| ConfigError::CheckpointPath {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Read all persisted progress. Called once, before any tailer starts.
    /// An empty, missing or unparseable file is treated as no progress.
    pub fn load(&self) -> FxHashMap<String, LogPosition> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::info!(
                    path = %self.path.display(),
                    error = %err,
                    "cannot read checkpoint file, starting from scratch"
                );
                return FxHashMap::default();
            }
        };
        if raw.trim().is_empty() {
            tracing::info!(path = %self.path.display(), "empty checkpoint file");
            return FxHashMap::default();
        }
        let flat: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(flat) => flat,
            Err(err) => {
                tracing::info!(
                    path = %self.path.display(),
                    error = %err,
                    "checkpoint file is corrupt, starting from scratch"
                );
                return FxHashMap::default();
            }
        };
        let mut progress = FxHashMap::default();
        for pair in flat.chunks_exact(2) {
            match (&pair[0], pair[1].as_i64()) {
                (Value::String(shard_id), Some(raw_position)) => {
                    progress.insert(shard_id.clone(), LogPosition::from_i64(raw_position));
                }
                _ => {
                    tracing::info!(
                        path = %self.path.display(),
                        "checkpoint file has malformed entries, starting from scratch"
                    );
                    return FxHashMap::default();
                }
            }
        }
        progress
    }

    /// Persist a snapshot of the progress map.
    ///
    /// The previous file is renamed to `.backup` first and restored when
    /// the new write fails; on success the backup is deleted.
    pub fn save(&self, snapshot: &FxHashMap<String, LogPosition>) -> Result<(), ReplicationError> {
        let backup = self.backup_path();
        let had_previous = self.path.exists();
        if had_previous {
            fs::rename(&self.path, &backup).map_err(|err| {
                ReplicationError::operation(format!(
                    "cannot rotate checkpoint backup {}: {err}",
                    backup.display()
                ))
            })?;
        }

        let mut shard_ids: Vec<&String> = snapshot.keys().collect();
        shard_ids.sort();
        let mut flat: Vec<Value> = Vec::with_capacity(snapshot.len() * 2);
        for shard_id in shard_ids {
            flat.push(Value::String(shard_id.clone()));
            flat.push(Value::from(snapshot[shard_id].as_i64()));
        }

        let body = serde_json::to_vec(&flat)?;
        match fs::write(&self.path, body) {
            Ok(()) => {
                if had_previous {
                    let _ = fs::remove_file(&backup);
                }
                Ok(())
            }
            Err(err) => {
                if had_previous {
                    let _ = fs::rename(&backup, &self.path);
                }
                Err(ReplicationError::operation(format!(
                    "cannot write checkpoint file {}: {err}",
                    self.path.display()
                )))
            }
        }
    }
}
