//! Minimal runtime validator for tool input/output shapes.
//!
//! Tool definitions are data, so their input shapes can only be checked at
//! runtime. The contract is deliberately small: the payload must be a JSON
//! object, every `required` field must be present, and any field with a
//! declared type tag must match it. Handlers that want richer guarantees
//! deserialize the input into their own strongly-typed struct.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON type tag for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl ValueKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Null => value.is_null(),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// Declared shape of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ValueKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_kind() -> ValueKind {
    ValueKind::Any
}

/// Object schema: required field names plus optional type tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Field path (`$` for the payload root).
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field with a type tag.
    pub fn require(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(
            name,
            PropertySchema {
                kind,
                description: None,
            },
        );
        self
    }

    /// Declare an optional field with a type tag.
    pub fn optional(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.properties.insert(
            name.into(),
            PropertySchema {
                kind,
                description: None,
            },
        );
        self
    }

    /// Validate a payload. Returns every violation found, not just the first.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<SchemaViolation>> {
        let Some(object) = value.as_object() else {
            return Err(vec![SchemaViolation {
                path: "$".into(),
                reason: "expected an object".into(),
            }]);
        };

        let mut violations = Vec::new();

        for field in &self.required {
            if !object.contains_key(field) {
                violations.push(SchemaViolation {
                    path: field.clone(),
                    reason: "required field is missing".into(),
                });
            }
        }

        for (name, property) in &self.properties {
            if let Some(v) = object.get(name) {
                if !property.kind.matches(v) {
                    violations.push(SchemaViolation {
                        path: name.clone(),
                        reason: format!("expected {}", property.kind),
                    });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ObjectSchema {
        ObjectSchema::new()
            .require("key", ValueKind::String)
            .optional("limit", ValueKind::Integer)
    }

    #[test]
    fn valid_payload_passes() {
        assert!(schema().validate(&json!({"key": "a", "limit": 3})).is_ok());
        assert!(schema().validate(&json!({"key": "a"})).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let errs = schema().validate(&json!({"limit": 3})).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].path, "key");
    }

    #[test]
    fn wrong_type_fails() {
        let errs = schema().validate(&json!({"key": 5, "limit": "x"})).unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn non_object_fails() {
        let errs = schema().validate(&json!("key")).unwrap_err();
        assert_eq!(errs[0].path, "$");
    }

    #[test]
    fn deserializes_from_json_schema_subset() {
        let s: ObjectSchema = serde_json::from_value(json!({
            "required": ["text"],
            "properties": { "text": { "type": "string" }, "extra": {} }
        }))
        .unwrap();
        assert_eq!(s.required, vec!["text"]);
        assert_eq!(s.properties["extra"].kind, ValueKind::Any);
    }
}
