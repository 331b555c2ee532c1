//! Slow-query notifications.

use serde::Serialize;
use tracing::{info, warn};

/// A single query slower than its threshold.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuery {
    pub path_label: String,
    pub goal: String,
    pub duration_ms: f64,
    pub threshold_ms: f64,
}

/// A path whose rolling p95 crossed its budget.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetBreach {
    pub path_label: String,
    pub p95_ms: f64,
    pub budget_ms: f64,
    pub samples: usize,
}

/// Receives slow-query and budget events from a `QueryProfiler`.
///
/// Budget events are edge-triggered: `on_budget_breach` fires when a path
/// goes over budget and not again until `on_budget_recovered` has fired.
pub trait SlowQuerySink: Send + Sync {
    fn on_slow_query(&self, event: &SlowQuery);

    fn on_budget_breach(&self, event: &BudgetBreach);

    fn on_budget_recovered(&self, _event: &BudgetBreach) {}
}

/// Default sink: structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlowQueryLogger;

impl SlowQuerySink for SlowQueryLogger {
    fn on_slow_query(&self, event: &SlowQuery) {
        warn!(
            path = %event.path_label,
            goal = %event.goal,
            duration_ms = event.duration_ms,
            threshold_ms = event.threshold_ms,
            "slow query"
        );
    }

    fn on_budget_breach(&self, event: &BudgetBreach) {
        warn!(
            path = %event.path_label,
            p95_ms = event.p95_ms,
            budget_ms = event.budget_ms,
            samples = event.samples,
            "p95 over budget"
        );
    }

    fn on_budget_recovered(&self, event: &BudgetBreach) {
        info!(path = %event.path_label, p95_ms = event.p95_ms, budget_ms = event.budget_ms, "p95 back within budget");
    }
}
