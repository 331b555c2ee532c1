//! Profiler budgets, regressions, and batch integration.

use std::sync::{Arc, Mutex};

use kyrologic::profile::{load_budgets, BudgetBreach, QueryBatch, SlowQuery, SlowQuerySink, OTHER_LABEL};
use kyrologic::{AdapterSession, ProfilerConfig, QueryOptions, QueryProfiler, QueryResult, SessionConfig};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl SlowQuerySink for Recorder {
    fn on_slow_query(&self, event: &SlowQuery) {
        self.events.lock().unwrap().push(format!("slow:{}", event.path_label));
    }

    fn on_budget_breach(&self, event: &BudgetBreach) {
        self.events.lock().unwrap().push(format!("breach:{}", event.path_label));
    }

    fn on_budget_recovered(&self, event: &BudgetBreach) {
        self.events.lock().unwrap().push(format!("recovered:{}", event.path_label));
    }
}

fn timed(ms: f64) -> QueryResult {
    QueryResult {
        success: true,
        solutions: Vec::new(),
        time_ms: ms,
        error: None,
        cached: false,
    }
}

fn profiler(sink: Arc<Recorder>) -> QueryProfiler {
    let session = AdapterSession::new(SessionConfig::default()).unwrap();
    session.load_program("root(c). root(g).", "roots").unwrap();
    let config = ProfilerConfig {
        window: 10,
        min_samples: 5,
        ..ProfilerConfig::default()
    };
    QueryProfiler::with_sink(session, config, sink)
}

#[test]
fn budgets_from_file_drive_breach_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("budgets.toml");
    std::fs::write(
        &path,
        "[[budgets]]\npathLabel = \"chords.suggest\"\np95BudgetMs = 20.0\nsingleQueryMs = 100.0\n",
    )
    .unwrap();

    let sink = Arc::new(Recorder::default());
    let p = profiler(Arc::clone(&sink));
    p.set_budgets(load_budgets(&path).unwrap()).unwrap();

    for _ in 0..5 {
        p.record("chords.suggest", "root(X)", &timed(40.0));
    }
    p.record("chords.suggest", "root(X)", &timed(150.0));
    assert!(!p.check_budgets().passed());
    assert_eq!(p.check_budgets().failures().count(), 1);

    for _ in 0..10 {
        p.record("chords.suggest", "root(X)", &timed(2.0));
    }
    assert!(p.check_budgets().passed());
    assert_eq!(
        *sink.events.lock().unwrap(),
        vec![
            "breach:chords.suggest".to_string(),
            "slow:chords.suggest".to_string(),
            "recovered:chords.suggest".to_string(),
        ]
    );
}

#[test]
fn regressions_are_measured_against_a_baseline() {
    let p = profiler(Arc::new(Recorder::default()));
    for _ in 0..10 {
        p.record("harmony.next", "root(X)", &timed(5.0));
        p.record("voicing", "root(X)", &timed(5.0));
    }
    let baseline = p.baseline();
    for _ in 0..10 {
        p.record("harmony.next", "root(X)", &timed(9.0));
        p.record("voicing", "root(X)", &timed(5.2));
    }
    let regressions = p.detect_regressions(&baseline, 0.25);
    assert_eq!(regressions.len(), 1);
    assert_eq!(regressions[0].path_label, "harmony.next");
    assert!(regressions[0].ratio > 1.7);
}

#[test]
fn batches_record_under_one_label() {
    let p = profiler(Arc::new(Recorder::default()));
    let results = QueryBatch::new(p.session())
        .with("root(c)")
        .with("root(d)")
        .with("root(")
        .run_profiled(&p, "roots.check");
    assert_eq!(results.len(), 3);

    let stats = p.stats("roots.check").unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.failures, 2);

    p.query("bad label!", "root(c)", &QueryOptions::new());
    assert_eq!(p.stats(OTHER_LABEL).unwrap().count, 1);

    p.reset();
    assert!(p.all_stats().is_empty());
}
