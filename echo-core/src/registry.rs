//! Schema registry.
//!
//! An explicit object handed to each space at construction. Schemas validate
//! converged document values; they never take part in merging.

use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown schema {0}")]
    UnknownSchema(String),
    #[error("schema {0} already registered")]
    AlreadyRegistered(String),
    #[error("{schema}: value is not a map")]
    NotAMap { schema: String },
    #[error("{schema}: missing required field {field}")]
    MissingField { schema: String, field: String },
    #[error("{schema}: field {field} is {found:?}, expected {expected:?}")]
    WrongKind {
        schema: String,
        field: String,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("{schema}: unexpected field {field}")]
    UnexpectedField { schema: String, field: String },
    #[error("schema registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: ValueKind,
    pub required: bool,
}

/// Structural description of a document type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Fully qualified type name, e.g. `example.org/type/Task`.
    pub name: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldSpec>,
    /// Whether fields not listed are tolerated.
    pub open: bool,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            fields: BTreeMap::new(),
            open: true,
        }
    }

    pub fn required(mut self, field: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.insert(field.into(), FieldSpec { kind, required: true });
        self
    }

    pub fn optional(mut self, field: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.insert(field.into(), FieldSpec { kind, required: false });
        self
    }

    pub fn closed(mut self) -> Self {
        self.open = false;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let Some(map) = value.as_map() else {
            return Err(SchemaError::NotAMap {
                schema: self.name.clone(),
            });
        };
        for (field, spec) in &self.fields {
            match map.get(field) {
                None if spec.required => {
                    return Err(SchemaError::MissingField {
                        schema: self.name.clone(),
                        field: field.clone(),
                    })
                }
                None => {}
                Some(Value::Null) if !spec.required => {}
                Some(v) if v.kind() != spec.kind => {
                    return Err(SchemaError::WrongKind {
                        schema: self.name.clone(),
                        field: field.clone(),
                        expected: spec.kind,
                        found: v.kind(),
                    })
                }
                Some(_) => {}
            }
        }
        if !self.open {
            if let Some(extra) = map.keys().find(|k| !self.fields.contains_key(*k)) {
                return Err(SchemaError::UnexpectedField {
                    schema: self.name.clone(),
                    field: extra.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: Schema) -> Result<(), SchemaError> {
        let mut schemas = self.schemas.write().map_err(|_| SchemaError::Poisoned)?;
        if schemas.contains_key(&schema.name) {
            return Err(SchemaError::AlreadyRegistered(schema.name));
        }
        log::debug!("Registered schema {} v{}", schema.name, schema.version);
        schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Schema> {
        self.schemas.read().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.read().map(|s| s.contains_key(name)).unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .schemas
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn validate(&self, name: &str, value: &Value) -> Result<(), SchemaError> {
        let schema = self
            .get(name)
            .ok_or_else(|| SchemaError::UnknownSchema(name.to_string()))?;
        schema.validate(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Schema {
        Schema::new("example.Task")
            .required("title", ValueKind::String)
            .optional("done", ValueKind::Bool)
    }

    #[test]
    fn test_register_and_validate() {
        let registry = SchemaRegistry::new();
        registry.register(task()).unwrap();
        assert!(matches!(registry.register(task()), Err(SchemaError::AlreadyRegistered(_))));

        let ok = Value::from_json(&serde_json::json!({"title": "x", "done": null, "extra": 1}));
        registry.validate("example.Task", &ok).unwrap();

        let missing = Value::from_json(&serde_json::json!({"done": true}));
        assert!(matches!(
            registry.validate("example.Task", &missing),
            Err(SchemaError::MissingField { .. })
        ));

        let wrong = Value::from_json(&serde_json::json!({"title": 3}));
        assert!(matches!(
            registry.validate("example.Task", &wrong),
            Err(SchemaError::WrongKind { expected: ValueKind::String, found: ValueKind::Int, .. })
        ));

        assert!(matches!(
            registry.validate("example.Other", &ok),
            Err(SchemaError::UnknownSchema(_))
        ));
    }

    #[test]
    fn test_closed_schema() {
        let schema = task().closed();
        let extra = Value::from_json(&serde_json::json!({"title": "x", "extra": 1}));
        assert!(matches!(schema.validate(&extra), Err(SchemaError::UnexpectedField { .. })));
        assert!(matches!(schema.validate(&Value::Int(1)), Err(SchemaError::NotAMap { .. })));
    }

    #[test]
    fn test_names_sorted() {
        let registry = SchemaRegistry::new();
        registry.register(Schema::new("b")).unwrap();
        registry.register(Schema::new("a")).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.contains("a"));
    }
}
