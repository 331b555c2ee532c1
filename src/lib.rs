//! # kyrologic - Embedded Rule-Based Reasoning Runtime
//!
//! kyrologic runs rule-language programs inside a host application. The host
//! keeps its own state; the runtime answers questions about it and suggests
//! actions, but never changes anything by itself.
//!
//! ## Core Concepts
//!
//! - **AdapterSession**: one isolated interpreter on its own worker thread
//! - **KnowledgeModule**: a named, versioned bundle of rules in a tier
//! - **KbManager**: loads modules into a session exactly once, migrating on version change
//! - **ModuleCache**: content-addressed store of compiled modules
//! - **QueryProfiler**: per-label latency percentiles against declared budgets
//! - **IntentBridge**: writes an `IntentSpec` into a session as facts
//! - **ActionProposal**: a confidence-scored suggestion decoded from `action/3` terms
//!
//! ## Usage
//!
//! ```rust
//! use kyrologic::{AdapterSession, SessionConfig};
//!
//! let session = AdapterSession::new(SessionConfig::default()).unwrap();
//! session
//!     .load_program("chord_tone(c, major, [c, e, g]).", "theory-core")
//!     .unwrap();
//!
//! let result = session.query_single("chord_tone(c, major, X)");
//! assert!(result.success);
//!
//! let proposals = session.query_host_actions("action(set_tempo(120), 0.9, [because('fits genre')])");
//! assert_eq!(proposals[0].action_type.name(), "set_tempo");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Rule language
pub mod interpreter;
pub mod term;

// Runtime
pub mod engine;
pub mod lifecycle;
pub mod module_cache;
pub mod storage;

// Host-facing bridges and profiling
pub mod action;
pub mod intent;
pub mod profile;

pub mod config;
pub mod error;
pub mod ident;

// Re-export primary types at crate root for convenience
pub use action::{ActionProposal, ActionType, Confidence};
pub use config::{CacheConfig, RuntimeConfig};
pub use engine::{AdapterSession, QueryError, QueryHandle, QueryOptions, QueryResult, SessionConfig, SessionId, Solution};
pub use error::{
    BridgeError, ExecutionError, LogicError, LogicResult, ModuleError, ValidationError,
};
pub use intent::{Constraint, ConstraintRegistry, ConstraintSchema, IntentBridge, IntentSpec};
pub use interpreter::{Interpreter, InterpreterError, InterpreterFactory, Program, SldInterpreter};
pub use lifecycle::{KbManager, KnowledgeModule, LifecycleConfig, ModuleRegistry, ModuleState, ModuleVersion, Tier};
pub use module_cache::ModuleCache;
pub use profile::{PerfBudget, ProfilerConfig, QueryBatch, QueryProfiler, QueryStats};
pub use storage::{InMemoryKvStore, KeyValueStore, StorageError};
pub use term::{json_to_term, json_to_term_string, term_to_json, PredKey, Term};
