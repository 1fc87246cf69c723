//! Update-operator application.
//!
//! The supported operator language is a small subset: `$set` assigns dotted
//! paths (creating intermediate maps), `$unset` removes them. A spec with no
//! operators at all is a whole-document replacement. Anything else is
//! decided by the configured [`UpdatePolicy`].

use serde_json::{Map, Value};

use crate::document::Document;
use crate::errors::ReplicationError;

/// What to do with an update spec that carries operators outside the
/// supported `$set`/`$unset` subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Keep the fetched post-image as the replacement document. The source
    /// has already applied the unknown operators server-side, so the
    /// post-image is the correct target state.
    #[default]
    ReplaceDocument,
    /// Reject the entry with an operation failure.
    RejectUnknown,
}

/// Apply `spec` to `doc` in place.
///
/// `doc` is the resolved post-image fetched from the source; `unique_key`
/// names its id field, which survives whole-document replacement.
pub fn apply_update(
    doc: &mut Document,
    spec: &Value,
    unique_key: &str,
    policy: UpdatePolicy,
) -> Result<(), ReplicationError> {
    let Some(spec_map) = spec.as_object() else {
        return Err(ReplicationError::operation(format!(
            "malformed update spec: {spec}"
        )));
    };

    let has_operators = spec_map.keys().any(|key| key.starts_with('$'));
    if !has_operators {
        replace_document(doc, spec_map, unique_key);
        return Ok(());
    }

    let only_supported = spec_map
        .keys()
        .all(|key| key == "$set" || key == "$unset");
    if !only_supported {
        return match policy {
            // The post-image already reflects the update; nothing to do.
            UpdatePolicy::ReplaceDocument => Ok(()),
            UpdatePolicy::RejectUnknown => Err(ReplicationError::operation(format!(
                "unsupported update operators in spec: {spec}"
            ))),
        };
    }

    if let Some(sets) = spec_map.get("$set").and_then(Value::as_object) {
        for (path, value) in sets {
            set_path(doc, path, value.clone());
        }
    }
    if let Some(unsets) = spec_map.get("$unset").and_then(Value::as_object) {
        for path in unsets.keys() {
            unset_path(doc, path);
        }
    }
    Ok(())
}

fn replace_document(doc: &mut Document, replacement: &Document, unique_key: &str) {
    let id = doc.get(unique_key).cloned();
    *doc = replacement.clone();
    if let Some(id) = id {
        doc.entry(unique_key.to_string()).or_insert(id);
    }
}

/// Assign `value` at a dotted `path`, creating intermediate maps and
/// overwriting non-map intermediates.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = match segments.pop() {
        Some(leaf) => leaf,
        None => return,
    };
    let mut current = doc;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => unreachable!("slot was just replaced with an object"),
        };
    }
    current.insert(leaf.to_string(), value);
}

/// Remove the value at a dotted `path`. Missing paths are a no-op.
pub fn unset_path(doc: &mut Document, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = match segments.pop() {
        Some(leaf) => leaf,
        None => return,
    };
    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
    current.remove(leaf);
}

/// Read the value at a dotted `path`, if present.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut value = doc.get(first)?;
    for segment in segments {
        value = value.as_object()?.get(segment)?;
    }
    Some(value)
}
