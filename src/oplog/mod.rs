//! The change-log entry model.
//!
//! A [`LogEntry`] is one record from a shard's change log: a position, an
//! operation code, the affected namespace and the operation payload(s).

pub mod update_spec;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::namespace::Namespace;
use crate::position::LogPosition;

/// The operation kinds a change log can carry, with the source's
/// one-letter codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
}

impl Operation {
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Insert => "i",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Command => "c",
            Operation::Noop => "n",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Operation::Insert),
            "u" => Some(Operation::Update),
            "d" => Some(Operation::Delete),
            "c" => Some(Operation::Command),
            "n" => Some(Operation::Noop),
            _ => None,
        }
    }
}

/// One record from the source change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub position: LogPosition,
    pub op: Operation,
    pub namespace: Namespace,
    /// The payload: the inserted document, the update spec, the delete
    /// selector or the command body.
    pub object: Value,
    /// The update selector, present for update entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object2: Option<Value>,
    /// Set on writes produced by the chunk balancer; such traffic must not
    /// be re-applied at the sinks.
    #[serde(default)]
    pub from_migrate: bool,
}

impl LogEntry {
    pub fn insert(position: LogPosition, namespace: Namespace, doc: Document) -> Self {
        Self {
            position,
            op: Operation::Insert,
            namespace,
            object: Value::Object(doc),
            object2: None,
            from_migrate: false,
        }
    }

    pub fn update(
        position: LogPosition,
        namespace: Namespace,
        selector: Value,
        spec: Value,
    ) -> Self {
        Self {
            position,
            op: Operation::Update,
            namespace,
            object: spec,
            object2: Some(selector),
            from_migrate: false,
        }
    }

    pub fn delete(position: LogPosition, namespace: Namespace, selector: Value) -> Self {
        Self {
            position,
            op: Operation::Delete,
            namespace,
            object: selector,
            object2: None,
            from_migrate: false,
        }
    }

    pub fn command(position: LogPosition, database: &str, command: Value) -> Self {
        Self {
            position,
            op: Operation::Command,
            namespace: Namespace::new(database, "$cmd"),
            object: command,
            object2: None,
            from_migrate: false,
        }
    }

    /// A periodic no-op marker, as written by the source on startup and
    /// during idle periods.
    pub fn noop(position: LogPosition) -> Self {
        Self {
            position,
            op: Operation::Noop,
            namespace: Namespace::new("admin", "$noop"),
            object: Value::Object(Document::new()),
            object2: None,
            from_migrate: false,
        }
    }

    #[must_use]
    pub fn migrated(mut self) -> Self {
        self.from_migrate = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_codes_round_trip() {
        for op in [
            Operation::Insert,
            Operation::Update,
            Operation::Delete,
            Operation::Command,
            Operation::Noop,
        ] {
            assert_eq!(Operation::from_code(op.code()), Some(op));
        }
        assert_eq!(Operation::from_code("x"), None);
    }
}
