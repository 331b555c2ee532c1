//! Per-path query profiling.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::debug;

use crate::engine::{AdapterSession, QueryOptions, QueryResult};
use crate::error::ValidationError;
use crate::ident;

use super::budget::{Baseline, BudgetCheck, BudgetReport, PerfBudget, Regression};
use super::sink::{BudgetBreach, SlowQuery, SlowQueryLogger, SlowQuerySink};
use super::stats::{PathStats, QueryRecord, QueryStats};
use super::{ProfilerConfig, OTHER_LABEL};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct State {
    paths: HashMap<String, PathStats>,
    budgets: BTreeMap<String, PerfBudget>,
    breached: HashSet<String>,
}

/// Times queries against one session, grouped by caller label.
pub struct QueryProfiler {
    session: AdapterSession,
    config: ProfilerConfig,
    sink: Arc<dyn SlowQuerySink>,
    state: Mutex<State>,
}

impl std::fmt::Debug for QueryProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryProfiler")
            .field("session", &self.session.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Event {
    Slow(SlowQuery),
    Breach(BudgetBreach),
    Recovered(BudgetBreach),
}

impl QueryProfiler {
    #[must_use]
    pub fn new(session: AdapterSession, config: ProfilerConfig) -> Self {
        Self::with_sink(session, config, Arc::new(SlowQueryLogger))
    }

    #[must_use]
    pub fn with_sink(session: AdapterSession, config: ProfilerConfig, sink: Arc<dyn SlowQuerySink>) -> Self {
        Self {
            session,
            config,
            sink,
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn session(&self) -> &AdapterSession {
        &self.session
    }

    /// Replaces every budget.
    pub fn set_budgets(&self, budgets: Vec<PerfBudget>) -> Result<(), ValidationError> {
        for budget in &budgets {
            budget.validate()?;
        }
        let mut state = lock(&self.state);
        state.budgets = budgets.into_iter().map(|b| (b.path_label.clone(), b)).collect();
        state.breached.clear();
        Ok(())
    }

    #[must_use]
    pub fn budgets(&self) -> Vec<PerfBudget> {
        lock(&self.state).budgets.values().cloned().collect()
    }

    /// Runs `goal` on the session and records it under `label`.
    pub fn query(&self, label: &str, goal: &str, opts: &QueryOptions) -> QueryResult {
        let result = self.session.query(goal, opts);
        self.record(label, goal, &result);
        result
    }

    /// Records a result obtained elsewhere, e.g. from a batch.
    pub fn record(&self, label: &str, goal: &str, result: &QueryResult) {
        let mut events = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let label = self.resolve_label(state, label);
            let record = QueryRecord::from_result(&label, goal, result);
            let stats = state
                .paths
                .entry(label.clone())
                .or_insert_with(|| PathStats::new(self.config.window));
            stats.record(&record);
            let p95 = stats.p95();
            let samples = stats.window_len();

            let budget = state.budgets.get(&label);
            let threshold = budget
                .and_then(|b| b.single_query_ms)
                .or(self.config.slow_query_ms);
            if let Some(threshold_ms) = threshold.filter(|t| record.duration_ms > *t) {
                events.push(Event::Slow(SlowQuery {
                    path_label: label.clone(),
                    goal: goal.to_string(),
                    duration_ms: record.duration_ms,
                    threshold_ms,
                }));
            }

            if let Some(budget_ms) = budget.map(|b| b.p95_budget_ms) {
                if samples >= self.config.min_samples {
                    let breach = BudgetBreach {
                        path_label: label.clone(),
                        p95_ms: p95,
                        budget_ms,
                        samples,
                    };
                    let over = p95 > budget_ms;
                    let was_over = state.breached.contains(&label);
                    if over && !was_over {
                        state.breached.insert(label);
                        events.push(Event::Breach(breach));
                    } else if !over && was_over {
                        state.breached.remove(&label);
                        events.push(Event::Recovered(breach));
                    }
                }
            }
        }
        // Sinks run outside the lock.
        for event in events {
            match event {
                Event::Slow(e) => self.sink.on_slow_query(&e),
                Event::Breach(e) => self.sink.on_budget_breach(&e),
                Event::Recovered(e) => self.sink.on_budget_recovered(&e),
            }
        }
    }

    /// Folds invalid labels and labels past `max_labels` into `__other__`.
    fn resolve_label(&self, state: &State, label: &str) -> String {
        if state.paths.contains_key(label) {
            return label.to_string();
        }
        if !ident::is_match(ident::PATH_LABEL, label) {
            debug!(label, "invalid path label folded into {OTHER_LABEL}");
            return OTHER_LABEL.to_string();
        }
        let distinct = state.paths.keys().filter(|k| *k != OTHER_LABEL).count();
        if distinct >= self.config.max_labels {
            debug!(label, max_labels = self.config.max_labels, "label limit reached");
            return OTHER_LABEL.to_string();
        }
        label.to_string()
    }

    #[must_use]
    pub fn stats(&self, label: &str) -> Option<QueryStats> {
        lock(&self.state).paths.get(label).map(|s| s.snapshot(label))
    }

    /// Stats for every label, sorted.
    #[must_use]
    pub fn all_stats(&self) -> Vec<QueryStats> {
        let state = lock(&self.state);
        let mut all: Vec<QueryStats> = state.paths.iter().map(|(l, s)| s.snapshot(l)).collect();
        all.sort_by(|a, b| a.label.cmp(&b.label));
        all
    }

    /// Checks every budget against the current windows. A label with no
    /// samples passes.
    #[must_use]
    pub fn check_budgets(&self) -> BudgetReport {
        let state = lock(&self.state);
        let checks = state
            .budgets
            .values()
            .map(|budget| {
                let (p95_ms, samples) = state
                    .paths
                    .get(&budget.path_label)
                    .map_or((0.0, 0), |s| (s.p95(), s.window_len()));
                BudgetCheck {
                    path_label: budget.path_label.clone(),
                    p95_ms,
                    budget_ms: budget.p95_budget_ms,
                    samples,
                    passed: p95_ms <= budget.p95_budget_ms,
                }
            })
            .collect();
        BudgetReport { checks }
    }

    /// Snapshot of every label's current p95.
    #[must_use]
    pub fn baseline(&self) -> Baseline {
        let state = lock(&self.state);
        Baseline {
            p95_ms: state
                .paths
                .iter()
                .filter(|(_, s)| s.window_len() > 0)
                .map(|(l, s)| (l.clone(), s.p95()))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    /// Labels whose p95 exceeds `baseline * (1 + tolerance)`. Labels absent
    /// from either side are ignored.
    #[must_use]
    pub fn detect_regressions(&self, baseline: &Baseline, tolerance: f64) -> Vec<Regression> {
        let current = self.baseline();
        baseline
            .p95_ms
            .iter()
            .filter_map(|(label, &before)| {
                let now = *current.p95_ms.get(label)?;
                let limit = before * (1.0 + tolerance.max(0.0));
                (now > limit).then(|| Regression {
                    path_label: label.clone(),
                    baseline_ms: before,
                    current_ms: now,
                    ratio: if before > 0.0 { now / before } else { f64::INFINITY },
                })
            })
            .collect()
    }

    /// Drops all recorded stats; budgets stay.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.paths.clear();
        state.breached.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{QueryError, SessionConfig};

    #[derive(Default)]
    struct Capture {
        slow: Mutex<Vec<SlowQuery>>,
        breaches: Mutex<Vec<BudgetBreach>>,
        recoveries: Mutex<Vec<BudgetBreach>>,
    }

    impl SlowQuerySink for Capture {
        fn on_slow_query(&self, event: &SlowQuery) {
            lock(&self.slow).push(event.clone());
        }
        fn on_budget_breach(&self, event: &BudgetBreach) {
            lock(&self.breaches).push(event.clone());
        }
        fn on_budget_recovered(&self, event: &BudgetBreach) {
            lock(&self.recoveries).push(event.clone());
        }
    }

    fn profiler(config: ProfilerConfig) -> (QueryProfiler, Arc<Capture>) {
        let session = AdapterSession::new(SessionConfig::default()).unwrap();
        let capture = Arc::new(Capture::default());
        let sink: Arc<dyn SlowQuerySink> = capture.clone();
        (QueryProfiler::with_sink(session, config, sink), capture)
    }

    fn timed(ms: f64) -> QueryResult {
        let mut r = QueryResult::from_solutions(Vec::new(), Duration::ZERO);
        r.time_ms = ms;
        r
    }

    #[test]
    fn records_real_queries() {
        let (p, _) = profiler(ProfilerConfig::default());
        p.session().load_program("n(1). n(2).", "nums").unwrap();
        let result = p.query("nums.all", "n(X)", &QueryOptions::default());
        assert_eq!(result.solutions.len(), 2);
        p.query("nums.all", "n(3)", &QueryOptions::default());
        let stats = p.stats("nums.all").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn label_cardinality_is_bounded() {
        let (p, _) = profiler(ProfilerConfig {
            max_labels: 2,
            ..ProfilerConfig::default()
        });
        for label in ["a", "b", "c", "d", "bad label"] {
            p.record(label, "g", &timed(1.0));
        }
        let labels: Vec<String> = p.all_stats().into_iter().map(|s| s.label).collect();
        assert_eq!(labels, vec!["__other__", "a", "b"]);
        assert_eq!(p.stats("__other__").unwrap().count, 3);
    }

    #[test]
    fn budget_events_are_edge_triggered() {
        let (p, capture) = profiler(ProfilerConfig {
            window: 4,
            min_samples: 1,
            ..ProfilerConfig::default()
        });
        p.set_budgets(vec![PerfBudget::new("path", 10.0).with_single_query_ms(30.0)])
            .unwrap();
        for _ in 0..4 {
            p.record("path", "g", &timed(20.0));
        }
        assert_eq!(lock(&capture.breaches).len(), 1);
        assert!(lock(&capture.slow).is_empty());
        assert!(!p.check_budgets().passed());

        for _ in 0..4 {
            p.record("path", "g", &timed(1.0));
        }
        assert_eq!(lock(&capture.recoveries).len(), 1);
        assert!(p.check_budgets().passed());

        p.record("path", "g", &timed(45.0));
        assert_eq!(lock(&capture.slow).len(), 1);
        assert_eq!(lock(&capture.breaches).len(), 2);
    }

    #[test]
    fn regressions_against_baseline() {
        let (p, _) = profiler(ProfilerConfig::default());
        p.record("fast", "g", &timed(2.0));
        p.record("steady", "g", &timed(5.0));
        let baseline = p.baseline();
        p.reset();
        p.record("fast", "g", &timed(4.0));
        p.record("steady", "g", &timed(5.2));
        let regressions = p.detect_regressions(&baseline, 0.1);
        assert_eq!(regressions.len(), 1);
        assert_eq!(regressions[0].path_label, "fast");
        assert!((regressions[0].ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn timeouts_are_counted() {
        let (p, _) = profiler(ProfilerConfig::default());
        let result = QueryResult::failed(QueryError::Timeout, Duration::from_millis(12));
        p.record("slow.path", "spin", &result);
        assert_eq!(p.stats("slow.path").unwrap().timeouts, 1);
    }
}
