//! Schema Validator (spec §4.3): validates a [`serde_json::Value`] against
//! the [`SchemaType`] subset and renders tool descriptors for LLM prompts.

use serde_json::Value;

use crate::error::SchemaError;
use crate::types::{SchemaType, ToolDescriptor};

/// Validate `input` against `schema`, returning the first mismatch found.
///
/// Validation is depth-first and stops at the first error rather than
/// collecting every mismatch, matching spec §4.3's "fails fast" behavior.
pub fn validate(schema: &SchemaType, input: &Value) -> Result<(), SchemaError> {
    validate_at("$", schema, input)
}

fn validate_at(path: &str, schema: &SchemaType, input: &Value) -> Result<(), SchemaError> {
    match schema {
        SchemaType::String => {
            if input.is_string() {
                Ok(())
            } else {
                Err(type_mismatch(path, "string", input))
            }
        }
        SchemaType::Number => {
            if input.is_number() {
                Ok(())
            } else {
                Err(type_mismatch(path, "number", input))
            }
        }
        SchemaType::Boolean => {
            if input.is_boolean() {
                Ok(())
            } else {
                Err(type_mismatch(path, "boolean", input))
            }
        }
        SchemaType::Array { items } => {
            let Some(elements) = input.as_array() else {
                return Err(type_mismatch(path, "array", input));
            };
            for (i, element) in elements.iter().enumerate() {
                validate_at(&format!("{path}[{i}]"), items, element)?;
            }
            Ok(())
        }
        SchemaType::Object {
            properties,
            required,
        } => {
            let Some(object) = input.as_object() else {
                return Err(if path == "$" {
                    SchemaError::NotAnObject
                } else {
                    type_mismatch(path, "object", input)
                });
            };
            for name in required {
                if !object.contains_key(name) {
                    return Err(SchemaError::MissingProperty(format!("{path}.{name}")));
                }
            }
            for (name, prop_schema) in properties {
                if let Some(value) = object.get(name) {
                    validate_at(&format!("{path}.{name}"), prop_schema, value)?;
                }
            }
            Ok(())
        }
    }
}

fn type_mismatch(path: &str, expected: &'static str, actual: &Value) -> SchemaError {
    SchemaError::TypeMismatch {
        path: path.to_string(),
        expected,
        actual: json_type_name(actual),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a tool descriptor as a compact text block suitable for inclusion
/// in an LLM's system prompt (spec §4.7 plan generation).
pub fn render_for_prompt(descriptor: &ToolDescriptor) -> String {
    let mut out = format!("- {}: {}\n", descriptor.id, descriptor.description);
    if let SchemaType::Object {
        properties,
        required,
    } = &descriptor.input_schema
    {
        for (name, prop) in properties {
            let marker = if required.contains(name) { "required" } else { "optional" };
            out.push_str(&format!(
                "    {name} ({}, {marker})\n",
                schema_type_name(prop)
            ));
        }
    }
    out
}

fn schema_type_name(schema: &SchemaType) -> &'static str {
    match schema {
        SchemaType::String => "string",
        SchemaType::Number => "number",
        SchemaType::Boolean => "boolean",
        SchemaType::Array { .. } => "array",
        SchemaType::Object { .. } => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn object_schema(required: &[&str]) -> SchemaType {
        let mut properties = BTreeMap::new();
        properties.insert("path".to_string(), SchemaType::String);
        properties.insert("recursive".to_string(), SchemaType::Boolean);
        SchemaType::Object {
            properties,
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn valid_input_passes() {
        let schema = object_schema(&["path"]);
        let input = json!({"path": "/tmp/x", "recursive": true});
        assert!(validate(&schema, &input).is_ok());
    }

    #[test]
    fn missing_required_property_fails() {
        let schema = object_schema(&["path"]);
        let input = json!({"recursive": true});
        let err = validate(&schema, &input).unwrap_err();
        assert!(matches!(err, SchemaError::MissingProperty(p) if p == "$.path"));
    }

    #[test]
    fn wrong_type_fails() {
        let schema = object_schema(&["path"]);
        let input = json!({"path": 42});
        let err = validate(&schema, &input).unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));
    }

    #[test]
    fn non_object_top_level_fails() {
        let schema = object_schema(&[]);
        let err = validate(&schema, &json!("not an object")).unwrap_err();
        assert!(matches!(err, SchemaError::NotAnObject));
    }

    #[test]
    fn nested_array_elements_are_validated() {
        let schema = SchemaType::Array {
            items: Box::new(SchemaType::String),
        };
        assert!(validate(&schema, &json!(["a", "b"])).is_ok());
        assert!(validate(&schema, &json!(["a", 1])).is_err());
    }
}
