use driftsync::document::Document;
use driftsync::errors::ReplicationError;
use driftsync::oplog::update_spec::{UpdatePolicy, apply_update, get_path, set_path, unset_path};
use serde_json::{Value, json};

fn doc(value: Value) -> Document {
    value.as_object().unwrap().clone()
}

#[test]
fn set_assigns_dotted_paths_creating_intermediates() {
    let mut target = doc(json!({"outer": "space"}));
    set_path(&mut target, "nested0.nested1.greeting", json!("hello"));
    assert_eq!(
        get_path(&target, "nested0.nested1.greeting"),
        Some(&json!("hello"))
    );

    // Setting below a scalar turns it into a map.
    set_path(&mut target, "outer.limits", json!("aliens"));
    assert_eq!(get_path(&target, "outer.limits"), Some(&json!("aliens")));
}

#[test]
fn unset_removes_paths_and_tolerates_missing_ones() {
    let mut target = doc(json!({"a": {"b": 1, "c": 2}, "top": 3}));
    unset_path(&mut target, "a.b");
    assert_eq!(get_path(&target, "a.b"), None);
    assert_eq!(get_path(&target, "a.c"), Some(&json!(2)));

    unset_path(&mut target, "does.not.exist");
    unset_path(&mut target, "top");
    assert!(!target.contains_key("top"));
}

#[test]
fn set_and_unset_compose_in_one_spec() {
    let mut target = doc(json!({"_id": "1", "a": 1, "b": 2}));
    apply_update(
        &mut target,
        &json!({"$unset": {"a": true}, "$set": {"c": 3}}),
        "_id",
        UpdatePolicy::default(),
    )
    .unwrap();
    assert_eq!(Value::Object(target), json!({"_id": "1", "b": 2, "c": 3}));
}

#[test]
fn operatorless_spec_replaces_the_document_preserving_the_id() {
    let mut target = doc(json!({"_id": "1", "old": true}));
    apply_update(
        &mut target,
        &json!({"fresh": 42}),
        "_id",
        UpdatePolicy::default(),
    )
    .unwrap();
    assert_eq!(Value::Object(target), json!({"_id": "1", "fresh": 42}));
}

#[test]
fn unknown_operators_keep_the_post_image_by_default() {
    // The fetched post-image already reflects the server-side $inc.
    let mut target = doc(json!({"_id": "1", "count": 5}));
    apply_update(
        &mut target,
        &json!({"$inc": {"count": 1}}),
        "_id",
        UpdatePolicy::ReplaceDocument,
    )
    .unwrap();
    assert_eq!(Value::Object(target), json!({"_id": "1", "count": 5}));
}

#[test]
fn unknown_operators_can_be_rejected() {
    let mut target = doc(json!({"_id": "1"}));
    let err = apply_update(
        &mut target,
        &json!({"$rename": {"a": "b"}}),
        "_id",
        UpdatePolicy::RejectUnknown,
    )
    .unwrap_err();
    assert!(matches!(err, ReplicationError::OperationFailed { .. }));
}

#[test]
fn malformed_specs_are_operation_failures() {
    let mut target = doc(json!({"_id": "1"}));
    let err = apply_update(&mut target, &json!(17), "_id", UpdatePolicy::default()).unwrap_err();
    assert!(matches!(err, ReplicationError::OperationFailed { .. }));
}
