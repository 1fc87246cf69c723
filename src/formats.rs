//! Document formatters: transforming source values into target-safe shapes.
//!
//! Formatters are pure functions over key/value pairs, invoked by sinks
//! right before indexing; the tailer always passes source documents through
//! unchanged. Two strategies ship with the crate: the default formatter
//! (numbers kept, binary to base64, everything else stringified) and a
//! flattening formatter that collapses nested maps and lists into dotted
//! paths.

use serde_json::{Map, Value};

use crate::document::Document;

/// Transforms documents to conform to external drivers' expectations.
///
/// Implementations override [`transform_value`](Self::transform_value) for
/// custom leaf handling; [`transform_element`](Self::transform_element) may
/// additionally be overridden when a single source pair expands into
/// several target pairs.
pub trait DocumentFormatter: Send + Sync {
    /// Transform a leaf value.
    fn transform_value(&self, value: &Value) -> Value;

    /// Transform a single key/value pair into the resulting pairs.
    fn transform_element(&self, key: &str, value: &Value) -> Vec<(String, Value)> {
        vec![(key.to_string(), self.transform_value(value))]
    }

    /// Format a whole document in preparation for the target.
    fn format_document(&self, document: &Document) -> Document {
        document
            .iter()
            .flat_map(|(key, value)| self.transform_element(key, value))
            .collect()
    }
}

/// Extended-JSON binary wrapper: `{"$binary": {"base64": "..."}}` or the
/// short form `{"$binary": "..."}`. Collapses to the base64 payload.
fn binary_payload(map: &Map<String, Value>) -> Option<String> {
    if map.len() != 1 {
        return None;
    }
    match map.get("$binary")? {
        Value::String(payload) => Some(payload.clone()),
        Value::Object(inner) => inner
            .get("base64")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Keeps numbers and strings, encodes binary as base64, recurses into maps
/// and lists, and stringifies every other scalar.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDocumentFormatter;

impl DocumentFormatter for DefaultDocumentFormatter {
    fn transform_value(&self, value: &Value) -> Value {
        match value {
            Value::Number(_) | Value::String(_) => value.clone(),
            Value::Object(map) => match binary_payload(map) {
                Some(payload) => Value::String(payload),
                None => Value::Object(self.format_document(map)),
            },
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.transform_value(item)).collect())
            }
            other => Value::String(other.to_string()),
        }
    }
}

/// Completely flattens documents and unwinds arrays.
///
/// ```text
/// {"a": 2, "b": {"c": {"d": 5}}, "e": [6, 7, 8]}
/// ```
///
/// becomes
///
/// ```text
/// {"a": 2, "b.c.d": 5, "e.0": 6, "e.1": 7, "e.2": 8}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentFlattener;

impl DocumentFormatter for DocumentFlattener {
    fn transform_value(&self, value: &Value) -> Value {
        DefaultDocumentFormatter.transform_value(value)
    }

    fn transform_element(&self, key: &str, value: &Value) -> Vec<(String, Value)> {
        match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .flat_map(|(index, item)| self.transform_element(&format!("{key}.{index}"), item))
                .collect(),
            Value::Object(map) => match binary_payload(map) {
                Some(payload) => vec![(key.to_string(), Value::String(payload))],
                None => map
                    .iter()
                    .flat_map(|(inner_key, inner_value)| {
                        self.transform_element(&format!("{key}.{inner_key}"), inner_value)
                    })
                    .collect(),
            },
            leaf => vec![(key.to_string(), self.transform_value(leaf))],
        }
    }
}
