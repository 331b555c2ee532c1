//! Engine adapter.
//!
//! An [`AdapterSession`] owns one interpreter running on its own worker thread,
//! together with the journal of modules consulted into it and a query cache.
//! Callers submit goals as text and get structured [`QueryResult`]s back;
//! proof search never runs on the caller's thread.
//!
//! Cancellation is cooperative. The interpreter receives the query deadline and
//! an abort flag. If the worker has not answered `abort_grace` after the
//! deadline, the session gives up on it, starts a fresh interpreter, replays
//! the module journal, and bumps [`AdapterSession::generation`]. Facts asserted
//! at run time do not survive that.

mod query_cache;
mod result;
mod session;
mod worker;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use query_cache::CacheStats;
pub use result::{QueryError, QueryOptions, QueryResult, Solution};
pub use session::{AdapterSession, QueryHandle};

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Creates a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// First eight hex digits, for thread names and log lines.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeout applied when `QueryOptions::timeout` is not set.
    pub default_timeout_ms: u64,
    /// How long past the deadline a worker may take to notice the abort
    /// before it is replaced.
    pub abort_grace_ms: u64,
    /// Maximum queued jobs per session.
    pub queue_capacity: usize,
    /// Maximum cached query results; `0` disables the cache.
    pub cache_capacity: usize,
    /// Resolution step limit per query.
    pub max_inferences: Option<u64>,
    /// Stack size of the worker thread.
    pub worker_stack_bytes: usize,
    /// Timeout for non-query jobs (consults, asserts, fact scans).
    pub job_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 1_000,
            abort_grace_ms: 250,
            queue_capacity: 64,
            cache_capacity: 512,
            max_inferences: None,
            worker_stack_bytes: 16 * 1024 * 1024,
            job_timeout_ms: 30_000,
        }
    }
}

const MIN_WORKER_STACK: usize = 64 * 1024;

impl SessionConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let reason = if self.default_timeout_ms == 0 {
            "session.default_timeout_ms must be positive"
        } else if self.job_timeout_ms == 0 {
            "session.job_timeout_ms must be positive"
        } else if self.queue_capacity == 0 {
            "session.queue_capacity must be positive"
        } else if self.worker_stack_bytes < MIN_WORKER_STACK {
            "session.worker_stack_bytes must be at least 64 KiB"
        } else if self.max_inferences == Some(0) {
            "session.max_inferences must be positive when set"
        } else {
            return Ok(());
        };
        Err(ValidationError::InvalidConfig {
            reason: reason.to_string(),
        })
    }
}
