//! Session isolation, cache invalidation, timeouts, and batching.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kyrologic::interpreter::{ConsultReport, QueryLimits, SolveOutcome};
use kyrologic::profile::QueryBatch;
use kyrologic::{
    AdapterSession, Interpreter, InterpreterError, PredKey, Program, QueryError, QueryOptions, SessionConfig,
    SldInterpreter, Term,
};

const FACTS: &str = "interval(c, e, 4). interval(c, g, 7). scale(major). spin :- spin.";

fn session() -> AdapterSession {
    let s = AdapterSession::new(SessionConfig::default()).unwrap();
    s.load_program(FACTS, "facts").unwrap();
    s
}

#[test]
fn sessions_do_not_share_facts() {
    let a = session();
    let b = session();
    a.assertz("heard(a)").unwrap();
    b.declare_dynamic(PredKey::new("heard", 1)).unwrap();
    assert!(a.succeeds("heard(a)"));
    assert!(!b.succeeds("heard(_)"));
}

#[test]
fn writes_invalidate_only_their_predicate() {
    let s = session();
    s.declare_dynamic(PredKey::new("seen", 1)).unwrap();
    assert!(!s.query_single("interval(c, e, N)").cached);
    assert!(s.query_single("interval(c, e, N)").cached);
    assert!(!s.query_single("seen(X)").success);

    s.assertz("seen(x)").unwrap();
    assert!(s.query_single("interval(c, e, N)").cached, "unrelated entry survived");
    let seen = s.query_single("seen(X)");
    assert!(seen.success && !seen.cached);

    assert_eq!(s.retract_all("seen(_)").unwrap(), 1);
    assert!(!s.query_single("seen(X)").success);
    assert!(s.cache_stats().invalidations >= 1);
}

#[test]
fn timeouts_are_enforced() {
    let s = session();
    for ms in [10_u64, 100, 1000] {
        let started = Instant::now();
        let result = s.query("spin", &QueryOptions::new().with_timeout(Duration::from_millis(ms)));
        let elapsed = started.elapsed();
        assert!(!result.success);
        assert_eq!(result.error, Some(QueryError::Timeout), "{ms}ms");
        assert!(elapsed >= Duration::from_millis(ms), "{ms}ms returned after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(ms) + Duration::from_secs(1), "{ms}ms took {elapsed:?}");
    }
    assert!(s.succeeds("scale(major)"));
}

#[test]
fn long_lists_survive_resolution_and_conversion() {
    let s = AdapterSession::new(SessionConfig::default()).unwrap();
    s.load_program("mk(0, []) :- !. mk(N, [N|T]) :- M is N - 1, mk(M, T).", "lists")
        .unwrap();
    let options = QueryOptions::new().with_timeout(Duration::from_secs(120));

    assert!(s.query("mk(20000, L), true", &options).success);

    let result = s.query("mk(500000, L)", &options);
    assert!(result.success, "{:?}", result.error);
    let value = result.solutions[0].get_json("L").unwrap();
    let items = value.as_array().unwrap();
    assert_eq!(items.len(), 500_000);
    assert_eq!(items[0], 500_000);
    assert_eq!(items[499_999], 1);
}

#[test]
fn batch_items_fail_independently() {
    let s = session();
    let mut batch = QueryBatch::new(&s);
    batch.push("interval(c, X, 7)", QueryOptions::new());
    batch.push("interval(c, (", QueryOptions::new());
    batch.push("spin", QueryOptions::new().with_timeout(Duration::from_millis(20)));
    batch.push("scale(minor)", QueryOptions::new());
    batch.push("scale(major)", QueryOptions::new());
    let results = batch.run();

    assert_eq!(results.len(), 5);
    assert!(results[0].success);
    assert_eq!(results[1].error.as_ref().map(QueryError::kind), Some("syntax"));
    assert!(results[2].is_timeout());
    assert!(!results[3].success && results[3].error.is_none());
    assert!(results[4].success);
}

#[test]
fn find_all_deserializes_templates() {
    let s = session();
    let found: Vec<(String, i64)> = s.find_all_as("[To, N]", "interval(c, To, N)").unwrap();
    assert_eq!(found, vec![("e".to_string(), 4), ("g".to_string(), 7)]);

    let json = s.find_all("iv(To, N)", "interval(c, To, N)").unwrap();
    assert_eq!(json[0], serde_json::json!({"iv": ["e", 4]}));
    assert!(s.find_all("X", "interval(d, X, _)").unwrap().is_empty());
}

#[test]
fn concurrent_sessions_run_in_parallel() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let s = session();
                s.assertz(&format!("worker({i})")).unwrap();
                s.query_all("worker(X)").solutions.len()
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 1);
    }
}

/// Wraps the built-in resolver but ignores deadlines on `hang/0`.
struct Stubborn(SldInterpreter);

impl Interpreter for Stubborn {
    fn consult(&mut self, module_tag: &str, program: &Program) -> Result<ConsultReport, InterpreterError> {
        self.0.consult(module_tag, program)
    }

    fn unload_module(&mut self, module_tag: &str) -> usize {
        self.0.unload_module(module_tag)
    }

    fn solve(&mut self, goal: &Term, var_count: usize, limits: &QueryLimits) -> Result<SolveOutcome, InterpreterError> {
        if goal.as_atom() == Some("hang") {
            thread::sleep(Duration::from_millis(400));
            return Ok(SolveOutcome::default());
        }
        self.0.solve(goal, var_count, limits)
    }

    fn assert_clause(&mut self, clause: &Term, at_end: bool) -> Result<PredKey, InterpreterError> {
        self.0.assert_clause(clause, at_end)
    }

    fn retract_all(&mut self, head: &Term) -> Result<usize, InterpreterError> {
        self.0.retract_all(head)
    }

    fn declare_dynamic(&mut self, key: &PredKey) {
        self.0.declare_dynamic(key);
    }

    fn matching_facts(&mut self, head: &Term) -> Result<Vec<Term>, InterpreterError> {
        self.0.matching_facts(head)
    }

    fn impure_predicates(&self) -> BTreeSet<PredKey> {
        self.0.impure_predicates()
    }
}

#[test]
fn unresponsive_worker_is_replaced_and_modules_replayed() {
    let config = SessionConfig {
        abort_grace_ms: 30,
        ..SessionConfig::default()
    };
    let factory = Arc::new(|| Box::new(Stubborn(SldInterpreter::new())) as Box<dyn Interpreter>);
    let s = AdapterSession::with_factory(config, factory).unwrap();
    s.load_program(FACTS, "facts").unwrap();
    s.assertz("temp(1)").unwrap();
    let before = s.generation();

    let started = Instant::now();
    let result = s.query("hang", &QueryOptions::new().with_timeout(Duration::from_millis(20)));
    assert!(result.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(300));

    assert_eq!(s.generation(), before + 1);
    assert!(s.succeeds("interval(c, g, 7)"), "consulted modules survive recreation");
    let lost = s.query_single("temp(1)");
    assert!(!lost.success, "asserted facts do not");
}
