//! Writes intent specs into a session.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::engine::AdapterSession;
use crate::error::{BridgeError, LogicResult};
use crate::interpreter::{Interpreter, InterpreterError};
use crate::term::{PredKey, Term};

use super::{spec_pred_keys, ConstraintRegistry, IntentSpec, CURRENT_SPEC, SPEC_PREDICATES};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for one `push`; popping with a stale token is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "pass the token to pop_scope to restore the previous spec"]
pub struct ScopeToken {
    depth: usize,
}

impl ScopeToken {
    /// Scope depth right after the `push` that issued this token (1 for the
    /// outermost scope).
    #[must_use]
    pub const fn depth(self) -> usize {
        self.depth
    }
}

/// One open head pattern per spec predicate, in encoding order.
fn spec_heads(spec_id: &str) -> Vec<Term> {
    SPEC_PREDICATES
        .iter()
        .map(|(name, arity)| {
            let mut args = vec![Term::atom(spec_id)];
            args.extend((1..*arity).map(|v| Term::Var(v - 1)));
            Term::compound(*name, args)
        })
        .collect()
}

fn collect_facts(interp: &mut dyn Interpreter, spec_id: &str) -> Result<Vec<Term>, InterpreterError> {
    let mut facts = Vec::new();
    for head in spec_heads(spec_id) {
        facts.extend(interp.matching_facts(&head)?);
    }
    Ok(facts)
}

fn clear_facts(interp: &mut dyn Interpreter, spec_id: &str) -> Result<usize, InterpreterError> {
    let mut removed = 0;
    for head in spec_heads(spec_id) {
        removed += interp.retract_all(&head)?;
    }
    Ok(removed)
}

fn assert_facts(interp: &mut dyn Interpreter, facts: &[Term]) -> Result<(), InterpreterError> {
    for fact in facts {
        interp.assert_clause(fact, true)?;
    }
    Ok(())
}

/// Encodes intent specs as facts in one session.
///
/// Persistent mode (`spec_to_facts`/`retract_spec`) keeps facts under a
/// caller-chosen id. Scoped mode (`push`/`pop`) swaps the facts of the
/// `current` spec and restores them exactly on pop. Each operation runs as a
/// single session job, so no query observes a half-written spec.
pub struct IntentBridge {
    session: AdapterSession,
    schemas: Arc<ConstraintRegistry>,
    scopes: Mutex<Vec<Vec<Term>>>,
}

impl std::fmt::Debug for IntentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentBridge")
            .field("session", &self.session.id())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl IntentBridge {
    /// Declares the spec predicates dynamic so queries on an empty spec fail
    /// instead of raising existence errors.
    pub fn new(session: AdapterSession, schemas: Arc<ConstraintRegistry>) -> LogicResult<Self> {
        for key in spec_pred_keys() {
            session.declare_dynamic(key)?;
        }
        Ok(Self {
            session,
            schemas,
            scopes: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn session(&self) -> &AdapterSession {
        &self.session
    }

    #[must_use]
    pub fn schemas(&self) -> &ConstraintRegistry {
        &self.schemas
    }

    fn keys() -> BTreeSet<PredKey> {
        spec_pred_keys().collect()
    }

    /// Writes `spec` under `spec_id`, replacing whatever that id held.
    /// Returns the number of facts asserted.
    pub fn spec_to_facts(&self, spec: &IntentSpec, spec_id: &str) -> LogicResult<usize> {
        let facts = spec.to_facts(spec_id, &self.schemas)?;
        let count = facts.len();
        let id = spec_id.to_string();
        self.session.transact(Self::keys(), move |interp| {
            clear_facts(interp, &id)?;
            assert_facts(interp, &facts)
        })?;
        debug!(session = %self.session.id(), spec = spec_id, facts = count, "spec asserted");
        Ok(count)
    }

    /// Removes every fact stored under `spec_id`.
    pub fn retract_spec(&self, spec_id: &str) -> LogicResult<usize> {
        let id = spec_id.to_string();
        let removed = self.session.transact(Self::keys(), move |interp| clear_facts(interp, &id))?;
        debug!(session = %self.session.id(), spec = spec_id, removed, "spec retracted");
        Ok(removed)
    }

    /// Facts currently stored under `spec_id`, in encoding order.
    pub fn facts(&self, spec_id: &str) -> LogicResult<Vec<Term>> {
        let mut facts = Vec::new();
        for head in spec_heads(spec_id) {
            facts.extend(self.session.matching_facts_term(head)?);
        }
        Ok(facts)
    }

    /// Makes `spec` the current spec, saving the previous one.
    pub fn push(&self, spec: &IntentSpec) -> LogicResult<ScopeToken> {
        let facts = spec.to_facts(CURRENT_SPEC, &self.schemas)?;
        let mut scopes = lock(&self.scopes);
        let saved = self.session.transact(Self::keys(), move |interp| {
            let saved = collect_facts(interp, CURRENT_SPEC)?;
            clear_facts(interp, CURRENT_SPEC)?;
            assert_facts(interp, &facts)?;
            Ok(saved)
        })?;
        scopes.push(saved);
        let depth = scopes.len();
        debug!(session = %self.session.id(), depth, "intent scope pushed");
        Ok(ScopeToken { depth })
    }

    /// Restores the spec saved by the most recent `push`.
    pub fn pop(&self) -> LogicResult<()> {
        let mut scopes = lock(&self.scopes);
        self.restore(&mut scopes)
    }

    /// Like `pop`, but fails unless `token` belongs to the innermost scope.
    pub fn pop_scope(&self, token: ScopeToken) -> LogicResult<()> {
        let mut scopes = lock(&self.scopes);
        if token.depth != scopes.len() {
            return Err(BridgeError::ScopeMismatch {
                token_depth: token.depth,
                current_depth: scopes.len(),
            }
            .into());
        }
        self.restore(&mut scopes)
    }

    fn restore(&self, scopes: &mut Vec<Vec<Term>>) -> LogicResult<()> {
        let saved = scopes.last().cloned().ok_or(BridgeError::ScopeUnderflow)?;
        self.session.transact(Self::keys(), move |interp| {
            clear_facts(interp, CURRENT_SPEC)?;
            assert_facts(interp, &saved)
        })?;
        scopes.pop();
        debug!(session = %self.session.id(), depth = scopes.len(), "intent scope popped");
        Ok(())
    }

    /// Number of open scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        lock(&self.scopes).len()
    }

    /// Runs `f` with `spec` as the current spec, then restores the previous
    /// one even if `f` returned an error.
    pub fn scoped<R>(&self, spec: &IntentSpec, f: impl FnOnce(&AdapterSession) -> R) -> LogicResult<R> {
        let token = self.push(spec)?;
        let out = f(&self.session);
        self.pop_scope(token)?;
        Ok(out)
    }
}
