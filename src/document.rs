//! Source documents and the field projection applied before dispatch.

use rustc_hash::FxHashSet;
use serde_json::{Map, Value};

use crate::namespace::Namespace;
use crate::position::LogPosition;

/// A source document: an arbitrary key/value tree with a unique id field.
pub type Document = Map<String, Value>;

/// Metadata key carrying the destination namespace on every dispatched doc.
pub const NS_FIELD: &str = "ns";
/// Metadata key carrying the log position (packed i64) of the write.
pub const TS_FIELD: &str = "_ts";

/// Extract the document id under the configured unique key.
pub fn document_id<'a>(doc: &'a Document, unique_key: &str) -> Option<&'a Value> {
    doc.get(unique_key)
}

/// Stamp the destination namespace and log position onto a document before
/// it is handed to the sinks.
pub fn attach_meta(doc: &mut Document, namespace: &Namespace, position: LogPosition) {
    doc.insert(NS_FIELD.to_string(), Value::String(namespace.to_string()));
    doc.insert(TS_FIELD.to_string(), Value::from(position.as_i64()));
}

/// Read the `_ts` metadata back off a sink-side document.
pub fn document_ts(doc: &Document) -> Option<i64> {
    doc.get(TS_FIELD).and_then(Value::as_i64)
}

/// An optional allow-list of exported fields.
///
/// When set, a dispatched document contains exactly the configured fields
/// plus the id, `ns` and `_ts` metadata, which are always kept.
#[derive(Debug, Clone, Default)]
pub struct FieldProjection {
    fields: Option<FxHashSet<String>>,
}

impl FieldProjection {
    pub fn new<I, S>(fields: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.map(|names| names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn keeps_all(&self) -> bool {
        self.fields.is_none()
    }

    pub fn apply(&self, doc: &mut Document, unique_key: &str) {
        let Some(fields) = &self.fields else { return };
        doc.retain(|key, _| {
            fields.contains(key) || key == unique_key || key == NS_FIELD || key == TS_FIELD
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn projection_keeps_metadata_and_listed_fields() {
        let mut doc = Document::new();
        doc.insert("_id".into(), json!("1"));
        doc.insert("name".into(), json!("Jo"));
        doc.insert("age".into(), json!(30));
        attach_meta(&mut doc, &Namespace::new("a", "b"), LogPosition::new(5, 0));

        let projection = FieldProjection::new(Some(["name"]));
        projection.apply(&mut doc, "_id");

        let mut keys: Vec<_> = doc.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["_id", "_ts", "name", "ns"]);
        assert_eq!(doc.get("ns"), Some(&json!("a.b")));
    }

    #[test]
    fn default_projection_keeps_everything() {
        let mut doc = Document::new();
        doc.insert("_id".into(), json!("1"));
        doc.insert("extra".into(), json!(true));
        FieldProjection::default().apply(&mut doc, "_id");
        assert_eq!(doc.len(), 2);
    }
}
