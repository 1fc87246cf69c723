mod common;

use std::fs;
use std::sync::Arc;

use common::{doc_from, eventually, launch, ns};
use driftsync::config::ReplicatorConfig;
use driftsync::sinks::MemorySink;
use driftsync::source::MemorySource;
use serde_json::{Value, json};

#[tokio::test(start_paused = true)]
async fn insert_reaches_sink_and_restart_does_not_redump() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let config = ReplicatorConfig::builder("memory:27017", &path)
        .namespace_set(["test.test"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    let sink = MemorySink::new("s1");

    let running = launch(&config, &source, &[sink.clone()]);
    let insert_pos = source.insert("0", &ns("test.test"), doc_from(json!({"_id": "a", "x": 1})));
    eventually("insert to reach the sink", || {
        sink.doc(&json!("a"))
            .is_some_and(|doc| doc.get("_ts") == Some(&json!(insert_pos.as_i64())))
    })
    .await;

    let stored = sink.doc(&json!("a")).unwrap();
    assert_eq!(stored.get("x"), Some(&json!(1)));
    assert_eq!(stored.get("ns"), Some(&json!("test.test")));
    assert_eq!(stored.get("_ts"), Some(&json!(insert_pos.as_i64())));

    running.stop().await.unwrap();

    let raw = fs::read_to_string(&path).unwrap();
    let flat: Vec<Value> = serde_json::from_str(&raw).unwrap();
    assert_eq!(flat, vec![json!("0"), json!(insert_pos.as_i64())]);

    // A document that only exists in the collection would be picked up by a
    // dump but not by tailing. The restart resumes from the checkpoint, so
    // it must never appear in the sink.
    source.load_document("0", &ns("test.test"), doc_from(json!({"_id": "ghost"})));

    let restarted = launch(&config, &source, &[sink.clone()]);
    eventually("restart to resume", || {
        restarted.progress.get("0") == Some(insert_pos)
    })
    .await;
    assert_eq!(sink.len(), 1);
    assert!(sink.doc(&json!("ghost")).is_none());
    restarted.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn update_resolves_the_post_image() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    let target = ns("test.test");
    source.insert("0", &target, doc_from(json!({"_id": "1", "a": 1, "b": 2})));
    source.update("0", &target, json!("1"), json!({"$unset": {"a": true}}));
    let last = source.update("0", &target, json!("1"), json!({"$set": {"c": 3}}));

    eventually("both updates to land", || {
        sink.doc(&json!("1"))
            .is_some_and(|doc| doc.get("_ts") == Some(&json!(last.as_i64())))
    })
    .await;

    let stored = sink.doc(&json!("1")).unwrap();
    assert_eq!(stored.get("a"), None);
    assert_eq!(stored.get("b"), Some(&json!(2)));
    assert_eq!(stored.get("c"), Some(&json!(3)));

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn field_projection_keeps_exactly_the_allow_list_plus_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .fields(["name"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    source.insert(
        "0",
        &ns("test.test"),
        doc_from(json!({"_id": "1", "name": "Jo", "age": 30})),
    );
    eventually("projected insert", || sink.len() == 1).await;

    let stored = sink.doc(&json!("1")).unwrap();
    let mut keys: Vec<&str> = stored.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["_id", "_ts", "name", "ns"]);
    assert_eq!(stored.get("name"), Some(&json!("Jo")));

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn balancer_traffic_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    let marker = source.noop("0");
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    // Wait out the (empty) initial dump: balancer traffic is dropped by
    // tailing, while a dump would legitimately copy migrated documents.
    eventually("startup dump to finish", || {
        running.progress.get("0") == Some(marker)
    })
    .await;

    let target = ns("test.test");
    source.insert_migrated("0", &target, doc_from(json!({"_id": "m"})));
    source.insert("0", &target, doc_from(json!({"_id": "direct"})));

    eventually("direct insert", || sink.doc(&json!("direct")).is_some()).await;
    assert!(sink.doc(&json!("m")).is_none());
    assert_eq!(sink.len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dump_seeds_sinks_and_checkpoints_at_dump_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    let marker = source.noop("0");
    let target = ns("test.test");
    for i in 0..5 {
        source.load_document("0", &target, doc_from(json!({"_id": i, "v": i})));
    }
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    eventually("dump to finish", || sink.len() == 5).await;
    for stored in sink.all_docs() {
        assert_eq!(stored.get("_ts"), Some(&json!(marker.as_i64())));
        assert_eq!(stored.get("ns"), Some(&json!("test.test")));
    }
    eventually("dump checkpoint", || running.progress.get("0") == Some(marker)).await;

    // Live tailing picks up right after the dump.
    source.insert("0", &target, doc_from(json!({"_id": "live"})));
    eventually("live insert after dump", || sink.len() == 6).await;

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_dump_skips_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .no_dump()
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    let target = ns("test.test");
    source.insert("0", &target, doc_from(json!({"_id": "old"})));
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    eventually("tailer to reach the log end", || {
        running.progress.get("0").is_some()
    })
    .await;
    source.insert("0", &target, doc_from(json!({"_id": "new"})));
    eventually("new insert", || sink.doc(&json!("new")).is_some()).await;

    // History before startup is never replayed without a dump.
    assert!(sink.doc(&json!("old")).is_none());
    assert_eq!(sink.len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn continue_on_error_skips_failing_dump_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .batch_size(1)
        .continue_on_error()
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    let target = ns("test.test");
    source.load_document("0", &target, doc_from(json!({"_id": "ok1"})));
    source.load_document(
        "0",
        &target,
        doc_from(json!({"_id": "bad", "_fail_upsert": true})),
    );
    source.load_document("0", &target, doc_from(json!({"_id": "ok2"})));

    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    eventually("dump to finish around the bad batch", || {
        running.progress.get("0").is_some()
    })
    .await;
    assert_eq!(sink.len(), 2);
    assert!(sink.doc(&json!("bad")).is_none());

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dump_failure_is_fatal_without_continue_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    source.load_document(
        "0",
        &ns("test.test"),
        doc_from(json!({"_id": "bad", "_fail_upsert": true})),
    );

    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink]);

    // The tailer dies on the dump failure and the supervisor tears down.
    assert!(running.wait().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn commands_are_ignored_by_sinks_without_support() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    source.command("0", "test", json!({"drop": "test"}));
    source.insert("0", &ns("test.test"), doc_from(json!({"_id": "after"})));

    eventually("insert after the command", || {
        sink.doc(&json!("after")).is_some()
    })
    .await;
    assert_eq!(sink.len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delete_of_a_missing_document_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig::builder("memory:27017", dir.path().join("progress.json"))
        .namespace_set(["test.test"])
        .build()
        .unwrap();

    let source = Arc::new(MemorySource::replica_set("rs0"));
    source.noop("0");
    let sink = MemorySink::new("s1");
    let running = launch(&config, &source, &[sink.clone()]);

    let target = ns("test.test");
    source.remove("0", &target, json!("never-existed"));
    source.insert("0", &target, doc_from(json!({"_id": "after"})));

    eventually("flow to continue past the delete", || {
        sink.doc(&json!("after")).is_some()
    })
    .await;

    running.stop().await.unwrap();
}
