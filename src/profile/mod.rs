//! Query batching and latency profiling.
//!
//! [`QueryBatch`] submits many goals to one session as a unit.
//! [`QueryProfiler`] times queries per caller label, keeps rolling
//! percentiles, and reports slow queries and budget breaches to a
//! [`SlowQuerySink`].

mod batch;
mod budget;
mod profiler;
mod sink;
mod stats;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use batch::QueryBatch;
pub use budget::{
    budgets_from_json, budgets_from_toml, load_budgets, Baseline, BudgetCheck, BudgetReport,
    PerfBudget, Regression,
};
pub use profiler::QueryProfiler;
pub use sink::{BudgetBreach, SlowQuery, SlowQueryLogger, SlowQuerySink};
pub use stats::{QueryRecord, QueryStats};

/// Label that absorbs overflow and invalid labels.
pub const OTHER_LABEL: &str = "__other__";

/// Profiler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Samples kept per label for percentiles.
    pub window: usize,
    /// Distinct labels before new ones fold into `__other__`.
    pub max_labels: usize,
    /// Slow-query threshold for labels without their own budget.
    pub slow_query_ms: Option<f64>,
    /// Samples required before budget events fire.
    pub min_samples: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            window: 500,
            max_labels: 64,
            slow_query_ms: None,
            min_samples: 20,
        }
    }
}

impl ProfilerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| {
            Err(ValidationError::InvalidConfig {
                reason: format!("profiler.{reason}"),
            })
        };
        if self.window == 0 {
            return invalid("window must be positive");
        }
        if self.max_labels == 0 {
            return invalid("max_labels must be positive");
        }
        if self.slow_query_ms.is_some_and(|ms| !ms.is_finite() || ms <= 0.0) {
            return invalid("slow_query_ms must be positive");
        }
        Ok(())
    }
}
