//! Rolling latency statistics.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::QueryResult;

/// One profiled query.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub label: String,
    pub goal: String,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cached: bool,
    pub at: DateTime<Utc>,
}

impl QueryRecord {
    pub(crate) fn from_result(label: &str, goal: &str, result: &QueryResult) -> Self {
        Self {
            label: label.to_string(),
            goal: goal.to_string(),
            duration_ms: result.time_ms,
            success: result.success,
            error: result.error.as_ref().map(|e| e.kind().to_string()),
            cached: result.cached,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some("timeout")
    }
}

/// Aggregated numbers for one path label.
///
/// Counts cover every query since the last reset; percentiles cover the
/// sliding window only.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub label: String,
    pub count: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub window_len: usize,
}

/// Fixed-capacity window of durations.
#[derive(Debug, Clone)]
pub(crate) struct Window {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Window {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Nearest-rank percentiles for each `q` in `qs` (0.0..=1.0), plus the max.
    pub(crate) fn percentiles<const N: usize>(&self, qs: [f64; N]) -> ([f64; N], f64) {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let Some(&max) = sorted.last() else {
            return ([0.0; N], 0.0);
        };
        let n = sorted.len();
        let out = qs.map(|q| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let rank = (q.clamp(0.0, 1.0) * n as f64).ceil() as usize;
            sorted[rank.clamp(1, n) - 1]
        });
        (out, max)
    }
}

/// Counters plus window for one label.
#[derive(Debug, Clone)]
pub(crate) struct PathStats {
    count: u64,
    failures: u64,
    timeouts: u64,
    window: Window,
}

impl PathStats {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            count: 0,
            failures: 0,
            timeouts: 0,
            window: Window::new(window),
        }
    }

    pub(crate) fn record(&mut self, record: &QueryRecord) {
        self.count += 1;
        if !record.success {
            self.failures += 1;
        }
        if record.is_timeout() {
            self.timeouts += 1;
        }
        self.window.push(record.duration_ms);
    }

    pub(crate) fn p95(&self) -> f64 {
        self.window.percentiles([0.95]).0[0]
    }

    pub(crate) fn window_len(&self) -> usize {
        self.window.len()
    }

    pub(crate) fn snapshot(&self, label: &str) -> QueryStats {
        let ([p50, p95, p99], max) = self.window.percentiles([0.50, 0.95, 0.99]);
        QueryStats {
            label: label.to_string(),
            count: self.count,
            failures: self.failures,
            timeouts: self.timeouts,
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
            max_ms: max,
            window_len: self.window.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let mut w = Window::new(100);
        for v in 1..=100 {
            w.push(f64::from(v));
        }
        let ([p50, p95, p99], max) = w.percentiles([0.5, 0.95, 0.99]);
        assert!((p50 - 50.0).abs() < f64::EPSILON);
        assert!((p95 - 95.0).abs() < f64::EPSILON);
        assert!((p99 - 99.0).abs() < f64::EPSILON);
        assert!((max - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn window_rolls() {
        let mut w = Window::new(3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        assert!((w.percentiles([1.0]).1 - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_window_is_zero() {
        let w = Window::new(10);
        assert_eq!(w.percentiles([0.5]), ([0.0], 0.0));
    }

    #[test]
    fn counts_outlive_the_window() {
        let mut stats = PathStats::new(2);
        let mut record = QueryRecord {
            label: "l".to_string(),
            goal: "g".to_string(),
            duration_ms: 5.0,
            success: true,
            error: None,
            cached: false,
            at: Utc::now(),
        };
        stats.record(&record);
        record.success = false;
        record.error = Some("timeout".to_string());
        stats.record(&record);
        stats.record(&record);
        let snap = stats.snapshot("l");
        assert_eq!((snap.count, snap.failures, snap.timeouts, snap.window_len), (3, 2, 2, 2));
    }
}
