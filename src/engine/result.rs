//! Query options and results.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::interpreter::{Answer, InterpreterError};
use crate::term::{term_to_json, Term};

/// Why a query produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum QueryError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("query timed out")]
    Timeout,

    #[error("unknown procedure {0}")]
    Existence(String),

    #[error("instantiation error: {0}")]
    Instantiation(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The worker died or was replaced before answering.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// The session queue was full.
    #[error("session overloaded: {0}")]
    Overloaded(String),
}

impl QueryError {
    /// Short machine-readable name (`"timeout"`, `"syntax"`, ...).
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Syntax(_) => "syntax",
            Self::Timeout => "timeout",
            Self::Existence(_) => "existence",
            Self::Instantiation(_) => "instantiation",
            Self::Type(_) => "type",
            Self::Evaluation(_) => "evaluation",
            Self::Permission(_) => "permission",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::SessionLost(_) => "session_lost",
            Self::Overloaded(_) => "overloaded",
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Errors that may go away if the same query is sent again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::SessionLost(_) | Self::Overloaded(_))
    }
}

impl From<InterpreterError> for QueryError {
    fn from(err: InterpreterError) -> Self {
        match err {
            InterpreterError::Syntax { message } => Self::Syntax(message),
            InterpreterError::Existence { predicate } => Self::Existence(predicate),
            InterpreterError::Instantiation { context } => Self::Instantiation(context),
            InterpreterError::Type { expected, culprit } => {
                Self::Type(format!("expected {expected}, found {culprit}"))
            }
            InterpreterError::Evaluation { message } => Self::Evaluation(message),
            InterpreterError::Permission { message } => Self::Permission(message),
            InterpreterError::ResourceExhausted { message } => Self::ResourceExhausted(message),
            InterpreterError::Timeout => Self::Timeout,
        }
    }
}

/// Per-query options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Stop after this many solutions (`None`: all of them).
    pub max_solutions: Option<usize>,
    /// Overrides the session's default timeout.
    pub timeout: Option<Duration>,
    /// Consult and populate the query cache.
    pub use_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_solutions: None,
            timeout: None,
            use_cache: true,
        }
    }
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_solutions(mut self, max: usize) -> Self {
        self.max_solutions = Some(max);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Bindings of the named query variables for one answer.
///
/// Unbound variables and variables whose names start with `_` are left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Solution {
    bindings: BTreeMap<String, Term>,
}

impl Solution {
    pub(crate) fn from_answer(answer: Answer, var_names: &[String]) -> Self {
        let bindings = answer
            .into_iter()
            .zip(var_names)
            .filter(|(_, name)| !name.starts_with('_'))
            .filter_map(|(value, name)| value.map(|term| (name.clone(), term)))
            .collect();
        Self { bindings }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Term> {
        self.bindings.get(name)
    }

    /// The binding of `name` as JSON.
    #[must_use]
    pub fn get_json(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).and_then(term_to_json)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Variable name to JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map = self
            .bindings
            .iter()
            .filter_map(|(name, term)| term_to_json(term).map(|v| (name.clone(), v)))
            .collect();
        Value::Object(map)
    }
}

impl Serialize for Solution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (name, term) in &self.bindings {
            if let Some(value) = term_to_json(term) {
                map.serialize_entry(name, &value)?;
            }
        }
        map.end()
    }
}

/// Outcome of one query.
///
/// A goal that fails is `success: false` with no error. A goal that could not
/// be run to completion carries an `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    pub solutions: Vec<Solution>,
    pub time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    /// Served from the session's query cache.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

impl QueryResult {
    pub(crate) fn from_solutions(solutions: Vec<Solution>, elapsed: Duration) -> Self {
        Self {
            success: !solutions.is_empty(),
            solutions,
            time_ms: duration_ms(elapsed),
            error: None,
            cached: false,
        }
    }

    pub(crate) fn failed(error: QueryError, elapsed: Duration) -> Self {
        Self {
            success: false,
            solutions: Vec::new(),
            time_ms: duration_ms(elapsed),
            error: Some(error),
            cached: false,
        }
    }

    #[must_use]
    pub fn first(&self) -> Option<&Solution> {
        self.solutions.first()
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().is_some_and(QueryError::is_timeout)
    }

    /// `Err` when the query reported an error; a plain failure is `Ok(self)`.
    pub fn into_result(self) -> Result<Self, QueryError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn solution_skips_unbound_and_underscore_names() {
        let answer = vec![Some(Term::atom("c")), None, Some(Term::Int(1))];
        let names = vec!["Root".to_string(), "X".to_string(), "_Hidden".to_string()];
        let solution = Solution::from_answer(answer, &names);
        assert_eq!(solution.len(), 1);
        assert_eq!(solution.to_json(), json!({"Root": "c"}));
        assert_eq!(serde_json::to_value(&solution).unwrap(), json!({"Root": "c"}));
    }

    #[test]
    fn result_serializes_in_camel_case() {
        let result = QueryResult::failed(QueryError::Timeout, Duration::from_millis(12));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!({"kind": "timeout"}));
        assert!(value.get("timeMs").is_some());
        assert!(value.get("cached").is_none());
    }

    #[test]
    fn interpreter_errors_map_to_kinds() {
        let err: QueryError = InterpreterError::Existence {
            predicate: "foo/1".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "existence");
        assert_eq!(QueryError::from(InterpreterError::Timeout).kind(), "timeout");
        assert!(QueryError::Timeout.is_retryable());
        assert!(!QueryError::Syntax("x".to_string()).is_retryable());
    }

    #[test]
    fn options_builder() {
        let opts = QueryOptions::new()
            .with_max_solutions(1)
            .with_timeout(Duration::from_millis(10))
            .without_cache();
        assert_eq!(opts.max_solutions, Some(1));
        assert!(!opts.use_cache);
        assert!(QueryOptions::default().use_cache);
    }
}
