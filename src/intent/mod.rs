//! Intent specs as session facts.
//!
//! An [`IntentSpec`] is the host's declarative description of what it wants.
//! The bridge writes it into a session as ground facts that rules can read:
//!
//! ```text
//! spec_key(SpecId, Root, Mode).
//! spec_meter(SpecId, Numerator, Denominator).
//! spec_tempo(SpecId, Bpm).
//! spec_genre(SpecId, Genre).
//! spec_field(SpecId, Name, Value).
//! spec_constraint(SpecId, Index, Type, Hard, Weight, [Field-Value, ...]).
//! ```
//!
//! Encoding is deterministic: the same spec always yields the same facts in
//! the same order.

mod bridge;
mod schema;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::term::{json_to_term, PredKey, Term};

pub use bridge::{IntentBridge, ScopeToken};
pub use schema::{ConstraintRegistry, ConstraintSchema, FieldKind, FieldSpec};

/// Spec id used by scoped (`push`/`pop`) mode.
pub const CURRENT_SPEC: &str = "current";

/// Predicates written by the bridge, in encoding order.
pub const SPEC_PREDICATES: [(&str, usize); 6] = [
    ("spec_key", 3),
    ("spec_meter", 3),
    ("spec_tempo", 2),
    ("spec_genre", 2),
    ("spec_field", 3),
    ("spec_constraint", 6),
];

pub(crate) fn spec_pred_keys() -> impl Iterator<Item = PredKey> {
    SPEC_PREDICATES.iter().map(|(name, arity)| PredKey::new(*name, *arity))
}

/// Time signature.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub numerator: u32,
    pub denominator: u32,
}

/// One weighted constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Registered constraint type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Hard constraints must hold; soft ones are weighed.
    #[serde(default)]
    pub hard: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub payload: Value,
}

const fn default_weight() -> f64 {
    1.0
}

impl Constraint {
    #[must_use]
    pub fn hard(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            hard: true,
            weight: default_weight(),
            payload,
        }
    }

    #[must_use]
    pub fn soft(kind: impl Into<String>, weight: f64, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            hard: false,
            weight,
            payload,
        }
    }
}

/// The host's desired outcome.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentSpec {
    pub key: Option<String>,
    pub mode: Option<String>,
    pub meter: Option<Meter>,
    pub tempo: Option<f64>,
    pub genre: Option<String>,
    /// Free-form extra fields, encoded in key order.
    pub fields: BTreeMap<String, Value>,
    pub constraints: Vec<Constraint>,
}

impl IntentSpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, root: impl Into<String>, mode: impl Into<String>) -> Self {
        self.key = Some(root.into());
        self.mode = Some(mode.into());
        self
    }

    #[must_use]
    pub const fn with_meter(mut self, numerator: u32, denominator: u32) -> Self {
        self.meter = Some(Meter { numerator, denominator });
        self
    }

    #[must_use]
    pub const fn with_tempo(mut self, bpm: f64) -> Self {
        self.tempo = Some(bpm);
        self
    }

    #[must_use]
    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Ground facts for this spec under `spec_id`. Fails without side effects
    /// on any invalid part.
    pub fn to_facts(&self, spec_id: &str, schemas: &ConstraintRegistry) -> Result<Vec<Term>, ValidationError> {
        if spec_id.is_empty() {
            return Err(ValidationError::InvalidIdentifier {
                value: String::new(),
                reason: "spec id must not be empty".to_string(),
            });
        }
        let id = || Term::atom(spec_id);
        let text_or_null = |v: &Option<String>| v.as_ref().map_or_else(|| Term::atom("null"), |s| Term::atom(s.clone()));
        let mut facts = Vec::new();

        if self.key.is_some() || self.mode.is_some() {
            facts.push(Term::compound(
                "spec_key",
                vec![id(), text_or_null(&self.key), text_or_null(&self.mode)],
            ));
        }
        if let Some(meter) = self.meter {
            if meter.numerator == 0 || meter.denominator == 0 {
                return Err(ValidationError::InvalidTerm {
                    reason: format!("meter {}/{} must be positive", meter.numerator, meter.denominator),
                });
            }
            facts.push(Term::compound(
                "spec_meter",
                vec![id(), Term::Int(meter.numerator.into()), Term::Int(meter.denominator.into())],
            ));
        }
        if let Some(bpm) = self.tempo {
            if !bpm.is_finite() || bpm <= 0.0 {
                return Err(ValidationError::InvalidTerm {
                    reason: format!("tempo {bpm} must be a positive number"),
                });
            }
            facts.push(Term::compound("spec_tempo", vec![id(), number_term(bpm)]));
        }
        if let Some(genre) = &self.genre {
            facts.push(Term::compound("spec_genre", vec![id(), Term::atom(genre.clone())]));
        }
        for (name, value) in &self.fields {
            if name.is_empty() {
                return Err(ValidationError::MissingField {
                    field: "fields.<name>".to_string(),
                });
            }
            facts.push(Term::compound(
                "spec_field",
                vec![id(), Term::atom(name.clone()), json_to_term(value)],
            ));
        }
        for (index, constraint) in self.constraints.iter().enumerate() {
            let schema = schemas.require(&constraint.kind)?;
            if !constraint.weight.is_finite() || constraint.weight < 0.0 {
                return Err(ValidationError::InvalidTerm {
                    reason: format!("constraint {index} weight {} must be non-negative", constraint.weight),
                });
            }
            let payload = schema.encode_payload(&constraint.payload)?;
            facts.push(Term::compound(
                "spec_constraint",
                vec![
                    id(),
                    Term::Int(i64::try_from(index).unwrap_or(i64::MAX)),
                    Term::atom(constraint.kind.clone()),
                    Term::atom(if constraint.hard { "true" } else { "false" }),
                    number_term(constraint.weight),
                    payload,
                ],
            ));
        }
        Ok(facts)
    }
}

/// Integral values become integers so `120.0` and `120` encode alike.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number_term(value: f64) -> Term {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Term::Int(value as i64)
    } else {
        Term::Float(value)
    }
}

/// Facts as rule-language text, one clause per line.
#[must_use]
pub fn facts_to_text(facts: &[Term]) -> String {
    facts.iter().map(|f| format!("{}.\n", f.to_canonical())).collect()
}
