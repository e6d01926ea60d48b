//! Write intents, the unit of work accepted by the [`BulkWriter`](crate::BulkWriter).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Field name to value mapping of a document.
pub type Fields = serde_json::Map<String, Value>;

/// The kind of a write operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Creates or replaces the whole document.
    Set,
    /// Merges the fields into an existing document.
    Update,
    /// Removes the document.
    Delete,
}

impl OpKind {
    /// Returns the lowercase name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Set => "set",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single write operation against a document, as sent to the backend.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Write {
    /// What to do with the document.
    #[serde(rename = "op")]
    pub kind: OpKind,
    /// The document key.
    pub key: String,
    /// The payload. Empty for deletes.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: Fields,
}

impl Write {
    /// Creates a write that replaces the document at `key`.
    pub fn set(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            kind: OpKind::Set,
            key: key.into(),
            fields,
        }
    }

    /// Creates a write that merges `fields` into the existing document at `key`.
    pub fn update(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            kind: OpKind::Update,
            key: key.into(),
            fields,
        }
    }

    /// Creates a write that deletes the document at `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            key: key.into(),
            fields: Fields::new(),
        }
    }

    /// Estimated encoded size of this write in bytes.
    ///
    /// Strings count with their length, numbers with 8 bytes and booleans or nulls with 1 byte,
    /// which is close to how document stores account for document size.
    pub fn size_hint(&self) -> u64 {
        let fields: u64 = self
            .fields
            .iter()
            .map(|(name, value)| name.len() as u64 + value_size(value))
            .sum();
        self.key.len() as u64 + fields
    }
}

fn value_size(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() as u64,
        Value::Array(items) => items.iter().map(value_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(name, value)| name.len() as u64 + value_size(value))
            .sum(),
    }
}

/// Identifier of a [`WriteIntent`], unique within one writer.
///
/// Identifiers are assigned in enqueue order, so comparing two of them compares their original
/// enqueue time.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IntentId(pub(crate) u64);

impl IntentId {
    /// Returns the raw sequence number.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A write that was accepted for dispatch.
///
/// Intents are immutable. They are owned by the queue until a batch is formed, then by the batch,
/// and finally handed back to the caller if they fail terminally.
#[derive(Clone, Debug)]
pub struct WriteIntent {
    id: IntentId,
    write: Write,
    enqueued_at: Instant,
}

impl WriteIntent {
    /// Creates a new intent with the given identifier, stamped with the current time.
    pub fn new(id: u64, write: Write) -> Self {
        Self {
            id: IntentId(id),
            write,
            enqueued_at: Instant::now(),
        }
    }

    /// The identifier of this intent.
    pub fn id(&self) -> IntentId {
        self.id
    }

    /// The write operation carried by this intent.
    pub fn write(&self) -> &Write {
        &self.write
    }

    /// When this intent was first enqueued.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Consumes the intent, returning the write.
    pub fn into_write(self) -> Write {
        self.write
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn size_hint_counts_key_and_fields() {
        let write = Write::set(
            "doc",
            fields(json!({ "name": "abcd", "n": 1, "ok": true, "tags": ["x", "yz"] })),
        );
        // key 3 + name(4+4) + n(1+8) + ok(2+1) + tags(4+1+2)
        assert_eq!(write.size_hint(), 3 + 8 + 9 + 3 + 7);
    }

    #[test]
    fn delete_has_no_fields() {
        let write = Write::delete("doc");
        assert_eq!(write.kind, OpKind::Delete);
        assert!(write.fields.is_empty());
        assert_eq!(write.size_hint(), 3);
    }

    #[test]
    fn serializes_with_op_tag() {
        let write = Write::update("doc", fields(json!({ "a": 1 })));
        let encoded = serde_json::to_value(&write).unwrap();
        assert_eq!(encoded, json!({ "op": "update", "key": "doc", "fields": { "a": 1 } }));

        let encoded = serde_json::to_value(Write::delete("gone")).unwrap();
        assert_eq!(encoded, json!({ "op": "delete", "key": "gone" }));
    }

    #[test]
    fn intent_ids_order_by_sequence() {
        let first = WriteIntent::new(1, Write::delete("a"));
        let second = WriteIntent::new(2, Write::delete("b"));
        assert!(first.id() < second.id());
        assert_eq!(second.id().to_string(), "#2");
    }
}
