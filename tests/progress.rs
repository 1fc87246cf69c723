use std::fs;

use driftsync::position::LogPosition;
use driftsync::progress::{CheckpointStore, ProgressMap};
use rustc_hash::FxHashMap;
use serde_json::{Value, json};

#[test]
fn open_creates_an_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let store = CheckpointStore::open(&path).unwrap();
    assert!(path.exists());
    assert!(store.load().is_empty());
}

#[test]
fn an_unusable_path_is_fatal_with_exit_code_two() {
    let dir = tempfile::tempdir().unwrap();
    let err = CheckpointStore::open(dir.path()).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn save_and_load_round_trip_in_the_flat_array_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let store = CheckpointStore::open(&path).unwrap();

    let mut snapshot = FxHashMap::default();
    snapshot.insert("1".to_string(), LogPosition::new(20, 2));
    snapshot.insert("0".to_string(), LogPosition::new(10, 1));
    store.save(&snapshot).unwrap();

    // Flat alternating array, shard ids sorted.
    let flat: Vec<Value> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        flat,
        vec![
            json!("0"),
            json!(LogPosition::new(10, 1).as_i64()),
            json!("1"),
            json!(LogPosition::new(20, 2).as_i64()),
        ]
    );

    let loaded = store.load();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get("0"), Some(&LogPosition::new(10, 1)));
    assert_eq!(loaded.get("1"), Some(&LogPosition::new(20, 2)));
}

#[test]
fn the_backup_sibling_is_rotated_away_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let store = CheckpointStore::open(&path).unwrap();

    let mut snapshot = FxHashMap::default();
    snapshot.insert("0".to_string(), LogPosition::new(1, 0));
    store.save(&snapshot).unwrap();
    snapshot.insert("0".to_string(), LogPosition::new(2, 0));
    store.save(&snapshot).unwrap();

    assert!(!dir.path().join("progress.json.backup").exists());
    assert_eq!(store.load().get("0"), Some(&LogPosition::new(2, 0)));
}

#[test]
fn corrupt_or_empty_files_mean_no_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    fs::write(&path, "").unwrap();
    let store = CheckpointStore::open(&path).unwrap();
    assert!(store.load().is_empty());

    fs::write(&path, "not json at all").unwrap();
    assert!(store.load().is_empty());

    fs::write(&path, "[\"0\", \"not-a-position\"]").unwrap();
    assert!(store.load().is_empty());
}

#[test]
fn progress_map_snapshot_happens_under_the_exclusive_section() {
    let progress = ProgressMap::new();
    progress.set("0", LogPosition::new(5, 0));
    progress.set("1", LogPosition::new(6, 0));

    let snapshot = progress.with_exclusive(|map| map.clone());
    assert_eq!(snapshot.len(), 2);
    assert_eq!(progress.get("0"), Some(LogPosition::new(5, 0)));

    progress.set("0", LogPosition::new(7, 0));
    assert_eq!(snapshot.get("0"), Some(&LogPosition::new(5, 0)));
    assert_eq!(progress.get("0"), Some(LogPosition::new(7, 0)));
}

#[test]
fn checkpoints_only_move_forward_between_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let store = CheckpointStore::open(&path).unwrap();

    let mut snapshot = FxHashMap::default();
    let mut last = LogPosition::new(0, 0);
    for seconds in 1..20u32 {
        let next = LogPosition::new(seconds, 0);
        assert!(next > last);
        snapshot.insert("0".to_string(), next);
        store.save(&snapshot).unwrap();
        let persisted = store.load()["0"];
        assert!(persisted >= last);
        last = persisted;
    }
}
