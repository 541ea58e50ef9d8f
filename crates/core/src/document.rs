//! Documents and JSON value comparison.
//!
//! A [`Document`] is a mapping of string keys to JSON values. The engine
//! treats payloads as opaque except for the reserved `_id` field and the
//! fields named by indexes. Reads hand out copies, never aliases into
//! engine state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::limits::{MAX_DOCUMENT_SIZE, MAX_NESTING_DEPTH};
use crate::types::validate_document_id;

/// Reserved primary-key field.
pub const ID_FIELD: &str = "_id";

/// A document: string keys mapped to JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Document(Map::new())
    }

    /// Build a document from an arbitrary JSON value. Anything but an
    /// object is a validation error.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => {
                let doc = Document(map);
                doc.validate()?;
                Ok(doc)
            }
            other => Err(Error::InvalidDocument(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Parse a document from raw JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_DOCUMENT_SIZE {
            return Err(Error::InvalidDocument(format!(
                "document of {} bytes exceeds maximum of {}",
                bytes.len(),
                MAX_DOCUMENT_SIZE
            )));
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidDocument(format!("bad JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0).expect("document maps always serialize")
    }

    /// The `_id` field, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Set the `_id` field, replacing any existing value.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// Look up a field by dotted path (`address.city`). Returns `None`
    /// when any segment is missing or traverses a non-object.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for seg in segments {
            current = current.as_object()?.get(seg)?;
        }
        Some(current)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Validate limits and the `_id` field shape.
    pub fn validate(&self) -> Result<()> {
        if let Some(id_value) = self.0.get(ID_FIELD) {
            match id_value {
                Value::String(s) => validate_document_id(s)?,
                other => {
                    return Err(Error::InvalidDocument(format!(
                        "_id must be a string, got {}",
                        type_name(other)
                    )))
                }
            }
        }
        let depth = 1 + self.0.values().map(value_depth).max().unwrap_or(0);
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::InvalidDocument(format!(
                "nesting depth {} exceeds maximum of {}",
                depth, MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Document(map)
    }
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Human-readable JSON type name for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compare two JSON values for filtering and sorting.
///
/// Numbers compare numerically with int/float coercion. Everything else
/// compares by its canonical text form, so mixed-type fields still have
/// a total, stable sort order. Callers decide what a missing field means
/// (a missing field never matches a positive operator).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => canonical_text(a).cmp(&canonical_text(b)),
    }
}

/// Equality with numeric coercion: `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn canonical_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_requires_object() {
        assert!(Document::from_value(json!({"a": 1})).is_ok());
        assert!(Document::from_value(json!([1, 2])).is_err());
        assert!(Document::from_value(json!("nope")).is_err());
    }

    #[test]
    fn id_must_be_string() {
        assert!(Document::from_value(json!({"_id": "u1"})).is_ok());
        assert!(Document::from_value(json!({"_id": 42})).is_err());
    }

    #[test]
    fn dotted_path_lookup() {
        let doc = Document::from_value(json!({
            "name": "Alice",
            "address": {"city": "Utrecht", "geo": {"lat": 52.09}}
        }))
        .unwrap();
        assert_eq!(doc.field("name"), Some(&json!("Alice")));
        assert_eq!(doc.field("address.city"), Some(&json!("Utrecht")));
        assert_eq!(doc.field("address.geo.lat"), Some(&json!(52.09)));
        assert_eq!(doc.field("address.zip"), None);
        assert_eq!(doc.field("name.x"), None);
    }

    #[test]
    fn numeric_coercion() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        // Strings compare as text, not numerically
        assert_eq!(compare_values(&json!("2"), &json!("10")), Ordering::Greater);
    }

    #[test]
    fn depth_limit_enforced() {
        let mut value = json!(1);
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            value = json!({ "n": value });
        }
        assert!(Document::from_value(value).is_err());
    }

    #[test]
    fn bytes_roundtrip() {
        let doc = Document::from_value(json!({"_id": "x", "v": [1, 2, 3]})).unwrap();
        let bytes = doc.to_bytes();
        assert_eq!(Document::from_bytes(&bytes).unwrap(), doc);
    }
}
