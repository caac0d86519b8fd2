//! Record and page types moved between backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend metadata (schema, mappings, settings) copied before data.
///
/// The shape is driver-defined; the engine only moves it.
pub type Meta = Value;

/// A single record in transit.
///
/// `id` is the idempotency key: targets that support overwrite use it so a
/// retried page does not duplicate records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity within its store.
    pub id: String,
    /// Record payload.
    pub body: Value,
}

impl Record {
    /// Create a record.
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Build a record from a JSON document, taking the id from `id_field`.
    ///
    /// Falls back to `position` when the document has no usable id, so that
    /// records read from id-less sources stay addressable.
    pub fn from_document(body: Value, id_field: &str, position: u64) -> Self {
        let id = match body.get(id_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => position.to_string(),
        };
        Self { id, body }
    }
}

/// A page of records returned by a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Records in stream order.
    pub records: Vec<Record>,
    /// The source has no records past this page.
    ///
    /// This is the explicit end-of-stream signal; an empty page alone does
    /// not imply exhaustion.
    pub exhausted: bool,
}

impl Page {
    /// Create a page.
    pub fn new(records: Vec<Record>, exhausted: bool) -> Self {
        Self { records, exhausted }
    }

    /// An empty page marking the end of the stream.
    pub fn end() -> Self {
        Self {
            records: Vec::new(),
            exhausted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_from_string_field() {
        let record = Record::from_document(json!({"id": "abc", "n": 1}), "id", 7);
        assert_eq!(record.id, "abc");
    }

    #[test]
    fn test_record_id_from_numeric_field() {
        let record = Record::from_document(json!({"key": 42}), "key", 7);
        assert_eq!(record.id, "42");
    }

    #[test]
    fn test_record_id_falls_back_to_position() {
        let record = Record::from_document(json!({"name": "x"}), "id", 7);
        assert_eq!(record.id, "7");
        let record = Record::from_document(json!({"id": null}), "id", 9);
        assert_eq!(record.id, "9");
    }

    #[test]
    fn test_end_page_is_empty_and_exhausted() {
        let page = Page::end();
        assert!(page.is_empty());
        assert!(page.exhausted);
        assert_eq!(page.len(), 0);
    }
}
