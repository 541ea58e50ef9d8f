//! Optional collection schemas.
//!
//! A schema constrains the shape of documents on write. Collections
//! without one accept any document. Schemas are part of the catalog and
//! travel over the wire in collection-create requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use loam_core::document::type_name;
use loam_core::{Document, Error, Result};

/// JSON value types a schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl FieldType {
    fn admits(&self, value: &Value) -> bool {
        match self {
            FieldType::Bool => value.is_boolean(),
            FieldType::Number => value.is_number(),
            FieldType::String => value.is_string(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// Constraint on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Shape constraints for one collection. Fields not mentioned are
/// unconstrained; `null` satisfies any non-required field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// Check a document against the schema.
    pub fn validate(&self, doc: &Document) -> Result<()> {
        for (field, spec) in &self.fields {
            match doc.field(field) {
                None => {
                    if spec.required {
                        return Err(Error::InvalidDocument(format!(
                            "required field {:?} is missing",
                            field
                        )));
                    }
                }
                Some(Value::Null) if !spec.required => {}
                Some(value) => {
                    if !spec.field_type.admits(value) {
                        return Err(Error::InvalidDocument(format!(
                            "field {:?} must be {:?}, got {}",
                            field,
                            spec.field_type,
                            type_name(value)
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(entries: &[(&str, FieldType, bool)]) -> Schema {
        Schema {
            fields: entries
                .iter()
                .map(|(name, field_type, required)| {
                    (
                        name.to_string(),
                        FieldSpec {
                            field_type: *field_type,
                            required: *required,
                        },
                    )
                })
                .collect(),
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn enforces_types_and_required_fields() {
        let schema = schema(&[("name", FieldType::String, true), ("age", FieldType::Number, false)]);

        assert!(schema.validate(&doc(json!({"name": "Alice", "age": 30}))).is_ok());
        assert!(schema.validate(&doc(json!({"name": "Alice"}))).is_ok());
        assert!(schema.validate(&doc(json!({"age": 30}))).is_err());
        assert!(schema.validate(&doc(json!({"name": 42}))).is_err());
    }

    #[test]
    fn null_satisfies_optional_fields_only() {
        let schema = schema(&[("a", FieldType::String, false), ("b", FieldType::String, true)]);
        assert!(schema.validate(&doc(json!({"a": null, "b": "x"}))).is_ok());
        assert!(schema.validate(&doc(json!({"b": null}))).is_err());
    }

    #[test]
    fn dotted_paths_reach_nested_fields() {
        let schema = schema(&[("address.city", FieldType::String, true)]);
        assert!(schema
            .validate(&doc(json!({"address": {"city": "Utrecht"}})))
            .is_ok());
        assert!(schema.validate(&doc(json!({"address": {}}))).is_err());
    }
}
