//! Error types for kyrologic.
//!
//! All errors in kyrologic are strongly typed using thiserror.
//! Query-level failures (a goal that fails, times out, or does not parse) are
//! *not* errors: they are reported as data inside `QueryResult`. The types here
//! cover programming errors, lifecycle failures, and bridge misuse.

use thiserror::Error;

use crate::engine::QueryError;
use crate::interpreter::InterpreterError;
use crate::lifecycle::{ModuleVersion, Tier};
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f64,
    },

    #[error("Percentage {value} is out of range [0, 100]")]
    PercentOutOfRange {
        value: f64,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Unexpected field '{field}' for {context}")]
    UnexpectedField {
        field: String,
        context: String,
    },

    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier {
        value: String,
        reason: String,
    },

    #[error("Invalid version '{value}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion {
        value: String,
    },

    #[error("Invalid term: {reason}")]
    InvalidTerm {
        reason: String,
    },

    #[error("Unknown constraint type '{name}'")]
    UnknownConstraintType {
        name: String,
    },

    #[error("Constraint type '{name}' is already registered with a different shape")]
    ConstraintShapeConflict {
        name: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while talking to a session worker.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Session {session} queue is full (capacity {capacity})")]
    QueueFull {
        session: String,
        capacity: usize,
    },

    #[error("Session {session} worker disconnected")]
    Disconnected {
        session: String,
    },

    #[error("Failed to start session worker: {message}")]
    WorkerSpawn {
        message: String,
    },

    #[error("Interpreter error: {0}")]
    Interpreter(#[from] InterpreterError),
}

/// Knowledge-module lifecycle errors.
///
/// These are `Clone` because one load outcome is shared by every caller that
/// requested the same module concurrently.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModuleError {
    #[error("Module '{module}' is not registered")]
    NotRegistered {
        module: String,
    },

    #[error("Module '{module}' has no registered version {version}")]
    VersionNotRegistered {
        module: String,
        version: ModuleVersion,
    },

    #[error("Module '{module}' v{version} is already registered with different content")]
    VersionConflict {
        module: String,
        version: ModuleVersion,
    },

    #[error("Module '{module}' v{version} failed to load in session {session}: {reason}")]
    LoadFailed {
        module: String,
        version: ModuleVersion,
        session: String,
        reason: String,
    },

    #[error("Module '{module}' depends on '{dependency}', which failed: {reason}")]
    DependencyFailed {
        module: String,
        dependency: String,
        reason: String,
    },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle {
        path: Vec<String>,
    },

    #[error("Module '{module}' is {tier} tier and cannot be unloaded")]
    NotUnloadable {
        module: String,
        tier: Tier,
    },

    #[error("Module '{module}' is required by loaded module '{dependent}'")]
    InUse {
        module: String,
        dependent: String,
    },
}

/// Intent/action bridge misuse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("pop() called with no active scope")]
    ScopeUnderflow,

    #[error("Scope mismatch: token for depth {token_depth}, but current depth is {current_depth}")]
    ScopeMismatch {
        token_depth: usize,
        current_depth: usize,
    },
}

/// Top-level error type for kyrologic.
#[derive(Debug, Clone, Error)]
pub enum LogicError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<InterpreterError> for LogicError {
    fn from(err: InterpreterError) -> Self {
        Self::Execution(ExecutionError::Interpreter(err))
    }
}

impl LogicError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if a query reported an error.
    #[must_use]
    pub const fn is_query(&self) -> bool {
        matches!(self, Self::Query(_))
    }

    /// Returns true if this is a module lifecycle error.
    #[must_use]
    pub const fn is_module(&self) -> bool {
        matches!(self, Self::Module(_))
    }

    /// Returns true if this is a bridge misuse error.
    #[must_use]
    pub const fn is_bridge(&self) -> bool {
        matches!(self, Self::Bridge(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Bridge(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
            Self::Query(e) => e.is_retryable(),
            // A failed consult may succeed after the host fixes the source or a dependency.
            Self::Module(e) => matches!(
                e,
                ModuleError::LoadFailed { .. } | ModuleError::DependencyFailed { .. }
            ),
            Self::Storage(e) => e.is_transient(),
        }
    }
}

/// Result type alias for kyrologic operations.
pub type LogicResult<T> = Result<T, LogicError>;
