//! Interpreter seam.
//!
//! An `AdapterSession` drives exactly one `Interpreter`, created on the
//! session's worker thread by an `InterpreterFactory`. The trait is the only
//! thing the runtime knows about proof search; `SldInterpreter` is the built-in
//! implementation.
//!
//! Cancellation is coarse: `QueryLimits` carries a deadline and an abort flag
//! that implementations should poll, but nothing forces them to. The adapter
//! treats an interpreter that does not return in time as lost and replaces it.

mod builtins;
mod database;
mod library;
mod machine;
mod program;
mod sld;

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::term::{PredKey, Term};

pub use program::{Program, ProgramClause};
pub use sld::SldInterpreter;

/// Errors raised by an interpreter while consulting or solving.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterpreterError {
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
    },

    #[error("unknown procedure {predicate}")]
    Existence {
        predicate: String,
    },

    #[error("arguments are not sufficiently instantiated in {context}")]
    Instantiation {
        context: String,
    },

    #[error("type error: expected {expected}, found {culprit}")]
    Type {
        expected: String,
        culprit: String,
    },

    #[error("evaluation error: {message}")]
    Evaluation {
        message: String,
    },

    #[error("permission error: {message}")]
    Permission {
        message: String,
    },

    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
    },

    #[error("query timed out")]
    Timeout,
}

/// Execution limits for a single `solve` call.
#[derive(Debug, Clone, Default)]
pub struct QueryLimits {
    /// Stop after this many answers.
    pub max_solutions: Option<usize>,
    /// Give up with `InterpreterError::Timeout` once this instant passes.
    pub deadline: Option<Instant>,
    /// Set by the session when the caller has given up on this worker.
    pub abort: Option<Arc<AtomicBool>>,
    /// Upper bound on resolution steps.
    pub max_inferences: Option<u64>,
}

/// One answer: the binding of each query variable, `None` when unbound.
pub type Answer = Vec<Option<Term>>;

/// Result of a successful `solve` call (zero answers means the goal failed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveOutcome {
    pub answers: Vec<Answer>,
    /// Predicates whose clauses were asserted or retracted while solving.
    pub mutated: BTreeSet<PredKey>,
    pub inferences: u64,
}

/// Summary of a consult.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsultReport {
    pub clauses: usize,
    pub predicates: BTreeSet<PredKey>,
}

/// A logic interpreter instance with its own clause database.
///
/// Implementations are driven from a single thread and need not be `Send`.
pub trait Interpreter {
    /// Adds `program`'s clauses, tagged with `module_tag`.
    fn consult(&mut self, module_tag: &str, program: &Program) -> Result<ConsultReport, InterpreterError>;

    /// Removes every clause tagged with `module_tag`. Returns the number removed.
    fn unload_module(&mut self, module_tag: &str) -> usize;

    /// Swaps a module's clauses for a new program in one step.
    fn replace_module(
        &mut self,
        module_tag: &str,
        program: &Program,
    ) -> Result<ConsultReport, InterpreterError> {
        self.unload_module(module_tag);
        self.consult(module_tag, program)
    }

    /// Proves `goal`, whose variables are numbered `0..var_count`.
    fn solve(
        &mut self,
        goal: &Term,
        var_count: usize,
        limits: &QueryLimits,
    ) -> Result<SolveOutcome, InterpreterError>;

    /// Adds a clause (`Head` or `Head :- Body`) at the end or the front.
    fn assert_clause(&mut self, clause: &Term, at_end: bool) -> Result<PredKey, InterpreterError>;

    /// Removes every clause whose head unifies with `head`.
    fn retract_all(&mut self, head: &Term) -> Result<usize, InterpreterError>;

    /// Marks a predicate as dynamic so calling it with no clauses fails quietly.
    fn declare_dynamic(&mut self, key: &PredKey);

    /// Facts (clauses with body `true`) whose head unifies with `head`, in
    /// database order, as ground-as-stored terms.
    fn matching_facts(&mut self, head: &Term) -> Result<Vec<Term>, InterpreterError>;

    /// Every predicate `goal` may read, transitively. `None` means the goal
    /// cannot be analysed (meta-calls on unbound goals) and must not be cached.
    fn dependencies(&self, goal: &Term) -> Option<BTreeSet<PredKey>> {
        let refs = goal_refs(goal);
        (!refs.opaque).then_some(refs.preds)
    }

    /// Predicates whose clauses can assert or retract when called, including
    /// those that call goals only known at run time.
    fn impure_predicates(&self) -> BTreeSet<PredKey> {
        BTreeSet::new()
    }
}

/// Creates interpreters for session workers.
pub trait InterpreterFactory: Send + Sync {
    fn create(&self) -> Box<dyn Interpreter>;
}

impl<F> InterpreterFactory for F
where
    F: Fn() -> Box<dyn Interpreter> + Send + Sync,
{
    fn create(&self) -> Box<dyn Interpreter> {
        self()
    }
}

/// Factory for the built-in resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SldFactory;

impl InterpreterFactory for SldFactory {
    fn create(&self) -> Box<dyn Interpreter> {
        Box::new(SldInterpreter::new())
    }
}

/// Builtins that modify the clause database.
pub const MUTATING_BUILTINS: [(&str, usize); 5] = [
    ("assert", 1),
    ("asserta", 1),
    ("assertz", 1),
    ("retract", 1),
    ("retractall", 1),
];

pub(crate) fn is_mutating(name: &str, arity: usize) -> bool {
    MUTATING_BUILTINS.iter().any(|(n, a)| *n == name && *a == arity)
}

/// Direct predicate references of a goal, looking through control constructs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalRefs {
    pub preds: BTreeSet<PredKey>,
    /// A sub-goal is an unbound variable or otherwise not statically known.
    pub opaque: bool,
    /// A sub-goal is a database mutation builtin.
    pub mutating: bool,
}

/// Argument positions holding goals for control and meta predicates.
pub(crate) fn meta_goal_args(name: &str, arity: usize) -> &'static [usize] {
    match (name, arity) {
        ("," | ";" | "->" | "*->" | "forall", 2) => &[0, 1],
        ("\\+" | "not" | "once" | "ignore", 1) => &[0],
        ("findall", 3 | 4) | ("aggregate_all", 3) => &[1],
        _ => &[],
    }
}

pub fn goal_refs(goal: &Term) -> GoalRefs {
    let mut refs = GoalRefs::default();
    collect_goal_refs(goal, 0, &mut refs);
    refs
}

fn collect_goal_refs(goal: &Term, extra_args: usize, refs: &mut GoalRefs) {
    let Some((name, arity)) = goal.functor() else {
        refs.opaque = true;
        return;
    };
    let arity = arity + extra_args;
    if extra_args == 0 {
        let metas = meta_goal_args(name, arity);
        if !metas.is_empty() {
            for idx in metas {
                collect_goal_refs(&goal.args()[*idx], 0, refs);
            }
            return;
        }
        if name == "call" && arity >= 1 {
            collect_goal_refs(&goal.args()[0], arity - 1, refs);
            return;
        }
    }
    if is_mutating(name, arity) {
        refs.mutating = true;
    }
    refs.preds.insert(PredKey::new(name, arity));
}
