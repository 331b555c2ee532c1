//! Query batching.

use std::time::Instant;

use crate::engine::{AdapterSession, QueryHandle, QueryOptions, QueryResult};

use super::QueryProfiler;

/// Goals submitted together.
///
/// `run` enqueues goals in windows the size of the session's queue, waiting on
/// each window before submitting the next, so a batch of any size fits the
/// bounded queue. Results come back in push order and a failing goal does not
/// affect the others.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    session: AdapterSession,
    items: Vec<(String, QueryOptions)>,
}

impl QueryBatch {
    #[must_use]
    pub fn new(session: &AdapterSession) -> Self {
        Self {
            session: session.clone(),
            items: Vec::new(),
        }
    }

    /// Adds a goal with default options.
    #[must_use]
    pub fn with(mut self, goal: impl Into<String>) -> Self {
        self.push(goal, QueryOptions::default());
        self
    }

    pub fn push(&mut self, goal: impl Into<String>, opts: QueryOptions) {
        self.items.push((goal.into(), opts));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Submits window by window and hands each result to `on_result` in push
    /// order.
    fn execute(&self, mut on_result: impl FnMut(&str, QueryResult)) {
        let window = self.session.config().queue_capacity.max(1);
        for chunk in self.items.chunks(window) {
            let handles: Vec<QueryHandle> = chunk
                .iter()
                .map(|(goal, opts)| self.session.submit_query(goal, opts))
                .collect();
            for (handle, (goal, _)) in handles.into_iter().zip(chunk) {
                on_result(goal, handle.join());
            }
        }
    }

    /// Runs the batch; one result per goal, in order.
    #[must_use]
    pub fn run(self) -> Vec<QueryResult> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(self.items.len());
        self.execute(|_, result| results.push(result));
        tracing::debug!(
            session = %self.session.id(),
            size = results.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "batch complete"
        );
        results
    }

    /// Runs the batch and records every result under `label`.
    #[must_use]
    pub fn run_profiled(self, profiler: &QueryProfiler, label: &str) -> Vec<QueryResult> {
        let mut results = Vec::with_capacity(self.items.len());
        self.execute(|goal, result| {
            profiler.record(label, goal, &result);
            results.push(result);
        });
        results
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::SessionConfig;
    use crate::profile::ProfilerConfig;

    #[test]
    fn results_keep_order_and_failures_stay_isolated() {
        let session = AdapterSession::new(SessionConfig::default()).unwrap();
        session.load_program("root(c). root(g). spin :- spin.", "t").unwrap();
        let mut batch = QueryBatch::new(&session).with("root(X)").with("root(d)").with("broken(");
        batch.push("spin", QueryOptions::default().with_timeout(Duration::from_millis(30)));
        let batch = batch.with("root(g)");
        assert_eq!(batch.len(), 5);

        let results = batch.run();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].solutions.len(), 2);
        assert!(!results[1].success && results[1].error.is_none());
        assert_eq!(results[2].error.as_ref().map(|e| e.kind()), Some("syntax"));
        assert!(results[3].is_timeout());
        assert!(results[4].success);
    }

    #[test]
    fn profiled_batch_records_each_goal() {
        let session = AdapterSession::new(SessionConfig::default()).unwrap();
        session.load_program("v(1).", "t").unwrap();
        let profiler = QueryProfiler::new(session.clone(), ProfilerConfig::default());
        let results = QueryBatch::new(&session)
            .with("v(1)")
            .with("v(2)")
            .run_profiled(&profiler, "batch.test");
        assert_eq!(results.len(), 2);
        let stats = profiler.stats("batch.test").unwrap();
        assert_eq!((stats.count, stats.failures), (2, 1));
    }

    #[test]
    fn batches_larger_than_the_queue_run_to_completion() {
        let config = SessionConfig {
            queue_capacity: 4,
            ..SessionConfig::default()
        };
        let session = AdapterSession::new(config).unwrap();
        session
            .load_program("slow(_) :- between(1, 20000, X), X >= 20000.", "t")
            .unwrap();
        let mut batch = QueryBatch::new(&session);
        for i in 0..10 {
            batch.push(format!("slow({i})"), QueryOptions::default());
        }

        let results = batch.run();
        assert_eq!(results.len(), 10);
        for (i, result) in results.iter().enumerate() {
            assert!(result.success, "goal {i}: {:?}", result.error);
        }
    }
}
