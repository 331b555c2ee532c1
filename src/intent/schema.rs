//! Constraint type shapes.
//!
//! A constraint type's fact shape is fixed once registered. Changing it means
//! registering a new type name.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ValidationError;
use crate::ident;
use crate::term::{json_to_term, Term};

/// Accepted JSON kind for one payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Atom,
    Number,
    Integer,
    Bool,
    List,
    Any,
}

impl FieldKind {
    pub(crate) fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Atom => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Any => true,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub optional: bool,
}

impl FieldSpec {
    #[must_use]
    pub const fn required(kind: FieldKind) -> Self {
        Self { kind, optional: false }
    }

    #[must_use]
    pub const fn optional(kind: FieldKind) -> Self {
        Self { kind, optional: true }
    }
}

/// Versioned payload shape of one constraint type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSchema {
    pub name: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ConstraintSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        ident::validate(ident::SNAKE_ATOM, &self.name, "constraint type")?;
        for name in self.fields.keys() {
            ident::validate(ident::SNAKE_ATOM, name, "constraint field")?;
        }
        Ok(())
    }

    /// Checks `payload` and encodes it as `[Field-Value, ...]` in field-name
    /// order. A `null` payload is treated as `{}`.
    pub fn encode_payload(&self, payload: &Value) -> Result<Term, ValidationError> {
        let empty = serde_json::Map::new();
        let object = match payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(ValidationError::InvalidTerm {
                    reason: format!("constraint '{}' payload must be an object, got {other}", self.name),
                })
            }
        };
        if let Some(extra) = object.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(ValidationError::UnexpectedField {
                field: extra.clone(),
                context: format!("constraint '{}'", self.name),
            });
        }
        let mut pairs = Vec::with_capacity(self.fields.len());
        for (name, spec) in &self.fields {
            match object.get(name) {
                None if spec.optional => {}
                None => {
                    return Err(ValidationError::MissingField {
                        field: format!("{}.{name}", self.name),
                    })
                }
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(ValidationError::InvalidTerm {
                        reason: format!(
                            "constraint '{}' field '{name}' expects {:?}, got {value}",
                            self.name, spec.kind
                        ),
                    })
                }
                Some(value) => pairs.push(Term::compound("-", vec![Term::atom(name.clone()), json_to_term(value)])),
            }
        }
        Ok(Term::list(pairs))
    }
}

/// Registered constraint types.
#[derive(Debug, Clone, Default)]
pub struct ConstraintRegistry {
    schemas: HashMap<String, ConstraintSchema>,
}

impl ConstraintRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a shape. Re-registering an identical shape is a no-op; a
    /// different shape under a known name is rejected.
    pub fn register(&mut self, schema: ConstraintSchema) -> Result<(), ValidationError> {
        schema.validate()?;
        if let Some(existing) = self.schemas.get(&schema.name) {
            if *existing == schema {
                return Ok(());
            }
            return Err(ValidationError::ConstraintShapeConflict { name: schema.name });
        }
        debug!(constraint = %schema.name, version = schema.version, "constraint type registered");
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConstraintSchema> {
        self.schemas.get(name)
    }

    /// Schema for `name`, or `UnknownConstraintType`.
    pub fn require(&self, name: &str) -> Result<&ConstraintSchema, ValidationError> {
        self.get(name).ok_or_else(|| ValidationError::UnknownConstraintType {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
