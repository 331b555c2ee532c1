//! Action proposals decoded from inference output.
//!
//! Rules suggest host actions with terms of the form
//!
//! ```text
//! action(ActionTerm, Confidence, [because(Explanation), ...])
//! ```
//!
//! The bridge turns each one into an [`ActionProposal`]. Proposals are data:
//! nothing here touches host state. Shapes the bridge does not recognize come
//! back as [`ActionType::Unknown`] with the raw term attached.

mod confidence;
mod host;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::ident;
use crate::intent::FieldKind;
use crate::term::{term_to_json, Term};

pub use confidence::Confidence;

/// Functor of the action wire shape.
pub const ACTION_FUNCTOR: &str = "action";

/// Functor wrapping one explanation in the reasons list.
pub const REASON_FUNCTOR: &str = "because";

/// Kind of action a proposal asks the host to perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ActionType {
    SetTempo,
    SetKey,
    SetMeter,
    Transpose,
    AddChord,
    /// Host-defined action named `ns:action`.
    Extension(String),
    /// Anything the bridge could not decode.
    Unknown,
}

impl ActionType {
    /// Wire name (`"set_tempo"`, `"ns:action"`, `"unknown"`).
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::SetTempo => "set_tempo",
            Self::SetKey => "set_key",
            Self::SetMeter => "set_meter",
            Self::Transpose => "transpose",
            Self::AddChord => "add_chord",
            Self::Extension(name) => name,
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    fn core(name: &str) -> Option<Self> {
        Some(match name {
            "set_tempo" => Self::SetTempo,
            "set_key" => Self::SetKey,
            "set_meter" => Self::SetMeter,
            "transpose" => Self::Transpose,
            "add_chord" => Self::AddChord,
            _ => return None,
        })
    }

    /// Positional payload fields of a core action.
    fn fields(&self) -> &'static [(&'static str, FieldKind)] {
        match self {
            Self::SetTempo => &[("bpm", FieldKind::Number)],
            Self::SetKey => &[("root", FieldKind::Atom), ("mode", FieldKind::Atom)],
            Self::SetMeter => &[("numerator", FieldKind::Integer), ("denominator", FieldKind::Integer)],
            Self::Transpose => &[("semitones", FieldKind::Integer)],
            Self::AddChord => &[("position", FieldKind::Number), ("chord", FieldKind::Any)],
            Self::Extension(_) | Self::Unknown => &[],
        }
    }
}

impl From<String> for ActionType {
    fn from(name: String) -> Self {
        if let Some(core) = Self::core(&name) {
            core
        } else if ident::is_match(ident::NAMESPACED, &name) {
            Self::Extension(name)
        } else {
            Self::Unknown
        }
    }
}

impl From<ActionType> for String {
    fn from(value: ActionType) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A confidence-scored suggestion for the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Named fields for core actions, positional `[args...]` for extensions,
    /// the JSON form of the raw term for unknown shapes.
    pub payload: Value,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Canonical text of the undecodable term (unknown proposals only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ActionProposal {
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        self.action_type.is_unknown()
    }

    /// Decodes one `action/3` term. Returns `None` when `term` does not have
    /// the wire shape at all.
    #[must_use]
    pub fn from_term(term: &Term) -> Option<Self> {
        if term.functor()? != (ACTION_FUNCTOR, 3) {
            return None;
        }
        let args = term.args();
        let (action_type, payload, raw) = decode_action_term(&args[0]);
        if action_type.is_unknown() {
            debug!(raw = raw.as_deref().unwrap_or(""), "unknown action shape");
        }
        Some(Self {
            action_type,
            payload,
            confidence: decode_confidence(&args[1]),
            reasons: decode_reasons(&args[2]),
            raw,
        })
    }

    /// The wire term for this proposal. Unknown proposals have no wire form.
    #[must_use]
    pub fn to_term(&self) -> Option<Term> {
        let args: Vec<Term> = match (&self.action_type, &self.payload) {
            (ActionType::Unknown, _) => return None,
            (ActionType::Extension(_), Value::Array(items)) => items.iter().map(crate::term::json_to_term).collect(),
            (ActionType::Extension(_), _) => Vec::new(),
            (core, Value::Object(fields)) => core
                .fields()
                .iter()
                .map(|(name, _)| fields.get(*name).map(crate::term::json_to_term))
                .collect::<Option<_>>()?,
            _ => return None,
        };
        let reasons = self
            .reasons
            .iter()
            .map(|r| Term::compound(REASON_FUNCTOR, vec![Term::Str(r.clone())]))
            .collect();
        Some(Term::compound(
            ACTION_FUNCTOR,
            vec![
                Term::compound(self.action_type.name(), args),
                Term::Float(self.confidence.value()),
                Term::list(reasons),
            ],
        ))
    }
}

fn unknown(term: &Term) -> (ActionType, Value, Option<String>) {
    (
        ActionType::Unknown,
        term_to_json(term).unwrap_or(Value::Null),
        Some(term.to_canonical()),
    )
}

fn decode_action_term(term: &Term) -> (ActionType, Value, Option<String>) {
    let Some((name, _)) = term.functor() else {
        return unknown(term);
    };

    // `ns:name(Args)` reads as `:(ns, name(Args))`.
    let (name, args) = match (name, term.args()) {
        (":", [Term::Atom(ns), inner]) if inner.is_callable() => match inner.functor() {
            Some((local, _)) => (format!("{ns}:{local}"), inner.args()),
            None => return unknown(term),
        },
        (name, args) => (name.to_string(), args),
    };

    match ActionType::from(name) {
        ActionType::Unknown => unknown(term),
        ActionType::Extension(name) => {
            let Some(values) = args.iter().map(term_to_json).collect::<Option<Vec<_>>>() else {
                return unknown(term);
            };
            (ActionType::Extension(name), Value::Array(values), None)
        }
        core => {
            let fields = core.fields();
            if fields.len() != args.len() {
                return unknown(term);
            }
            let mut payload = Map::new();
            for ((field, kind), arg) in fields.iter().zip(args) {
                match term_to_json(arg) {
                    Some(value) if kind.accepts(&value) => {
                        payload.insert((*field).to_string(), value);
                    }
                    _ => return unknown(term),
                }
            }
            (core, Value::Object(payload), None)
        }
    }
}

fn decode_confidence(term: &Term) -> Confidence {
    term.as_f64().map_or_else(
        || {
            warn!(confidence = %term.to_canonical(), "non-numeric action confidence; using 0");
            Confidence::zero()
        },
        Confidence::clamped,
    )
}

fn decode_reasons(term: &Term) -> Vec<String> {
    let reason = |t: &Term| match t {
        Term::Compound(name, args) if name == REASON_FUNCTOR && args.len() == 1 => args[0].to_plain_text(),
        other => other.to_plain_text(),
    };
    match term.list_items() {
        Some(items) => items.into_iter().map(reason).collect(),
        None if term.is_var() => Vec::new(),
        None => vec![reason(term)],
    }
}

/// Decodes every proposal inside `value`: an `action/3` term or a list that
/// contains some. Other values yield nothing.
pub(crate) fn proposals_in(value: &Term, out: &mut Vec<ActionProposal>) {
    if let Some(proposal) = ActionProposal::from_term(value) {
        out.push(proposal);
    } else if let Some(items) = value.list_items() {
        out.extend(items.into_iter().filter_map(ActionProposal::from_term));
    }
}
