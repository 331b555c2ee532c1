//! Declarative latency budgets.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LogicError, LogicResult, ValidationError};
use crate::ident;

/// Latency budget for one path label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfBudget {
    #[serde(alias = "path_label")]
    pub path_label: String,
    /// Ceiling for the rolling p95.
    #[serde(alias = "p95_budget_ms")]
    pub p95_budget_ms: f64,
    /// Any single query slower than this is reported as slow.
    #[serde(default, alias = "single_query_ms", skip_serializing_if = "Option::is_none")]
    pub single_query_ms: Option<f64>,
}

impl PerfBudget {
    #[must_use]
    pub fn new(path_label: impl Into<String>, p95_budget_ms: f64) -> Self {
        Self {
            path_label: path_label.into(),
            p95_budget_ms,
            single_query_ms: None,
        }
    }

    #[must_use]
    pub fn with_single_query_ms(mut self, ms: f64) -> Self {
        self.single_query_ms = Some(ms);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        ident::validate(ident::PATH_LABEL, &self.path_label, "path label")?;
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.p95_budget_ms) || !self.single_query_ms.map_or(true, positive) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("budget for '{}' must be positive", self.path_label),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct BudgetFile {
    #[serde(default)]
    budgets: Vec<PerfBudget>,
}

/// Parses budgets from TOML (`[[budgets]]` tables).
pub fn budgets_from_toml(text: &str) -> LogicResult<Vec<PerfBudget>> {
    let file: BudgetFile = toml::from_str(text).map_err(|e| ValidationError::InvalidConfig {
        reason: format!("budget TOML: {e}"),
    })?;
    validated(file.budgets)
}

/// Parses budgets from JSON: either an array or `{"budgets": [...]}`.
pub fn budgets_from_json(text: &str) -> LogicResult<Vec<PerfBudget>> {
    let invalid = |e: serde_json::Error| ValidationError::InvalidConfig {
        reason: format!("budget JSON: {e}"),
    };
    let budgets = if text.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<PerfBudget>>(text).map_err(invalid)?
    } else {
        serde_json::from_str::<BudgetFile>(text).map_err(invalid)?.budgets
    };
    validated(budgets)
}

/// Reads a budget file, choosing the format by extension.
pub fn load_budgets(path: &Path) -> LogicResult<Vec<PerfBudget>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        LogicError::from(ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => budgets_from_json(&text),
        _ => budgets_from_toml(&text),
    }
}

fn validated(budgets: Vec<PerfBudget>) -> LogicResult<Vec<PerfBudget>> {
    for budget in &budgets {
        budget.validate()?;
    }
    Ok(budgets)
}

/// Outcome for one budget.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub path_label: String,
    pub p95_ms: f64,
    pub budget_ms: f64,
    pub samples: usize,
    pub passed: bool,
}

/// Pass/fail report over every declared budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReport {
    pub checks: Vec<BudgetCheck>,
}

impl BudgetReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BudgetCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// p95 per label at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub p95_ms: BTreeMap<String, f64>,
    pub taken_at: DateTime<Utc>,
}

/// A label whose p95 grew past the baseline's tolerance.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Regression {
    pub path_label: String,
    pub baseline_ms: f64,
    pub current_ms: f64,
    pub ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_budgets() {
        let budgets = budgets_from_toml(
            r#"
            [[budgets]]
            path_label = "chords.suggest"
            p95_budget_ms = 20.0
            single_query_ms = 50.0

            [[budgets]]
            pathLabel = "harmony.next"
            p95BudgetMs = 5
            "#,
        )
        .unwrap();
        assert_eq!(budgets.len(), 2);
        assert_eq!(budgets[0].single_query_ms, Some(50.0));
        assert_eq!(budgets[1].path_label, "harmony.next");
    }

    #[test]
    fn json_budgets_in_both_shapes() {
        let a = budgets_from_json(r#"[{"pathLabel": "a", "p95BudgetMs": 1.5}]"#).unwrap();
        let b = budgets_from_json(r#"{"budgets": [{"pathLabel": "a", "p95BudgetMs": 1.5}]}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_budgets_are_rejected() {
        assert!(budgets_from_json(r#"[{"pathLabel": "a", "p95BudgetMs": 0}]"#).is_err());
        assert!(budgets_from_json(r#"[{"pathLabel": "bad label", "p95BudgetMs": 1}]"#).is_err());
        assert!(budgets_from_toml("budgets = 3").is_err());
    }
}
