//! The built-in resolver.

use std::collections::BTreeSet;

use tracing::error;

use crate::term::{PredKey, Term};

use super::builtins;
use super::database::Database;
use super::library;
use super::machine::{normalize_vars, Bindings, Machine};
use super::program::is_control;
use super::{
    goal_refs, Answer, ConsultReport, Interpreter, InterpreterError, Program, QueryLimits,
    SolveOutcome,
};

/// Depth-first SLD resolver over an in-memory clause database.
#[derive(Debug)]
pub struct SldInterpreter {
    db: Database,
}

impl Default for SldInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl SldInterpreter {
    #[must_use]
    pub fn new() -> Self {
        let mut db = Database::default();
        if let Err(err) = library::install(&mut db) {
            error!(error = %err, "list library failed to load");
        }
        Self { db }
    }

    fn check_program(&self, program: &Program) -> Result<(), InterpreterError> {
        for key in program.defined_predicates() {
            if builtins::is_builtin(&key.name, key.arity)
                || is_control(&key.name, key.arity)
                || self.db.is_locked(&key)
            {
                return Err(InterpreterError::Permission {
                    message: format!("cannot redefine {key}"),
                });
            }
        }
        Ok(())
    }

    fn add_program(&mut self, module_tag: &str, program: &Program) -> ConsultReport {
        for key in &program.dynamic {
            self.db.declare_dynamic(key);
        }
        for clause in &program.clauses {
            self.db.add(clause.clone(), Some(module_tag), true);
        }
        ConsultReport {
            clauses: program.clauses.len(),
            predicates: program.defined_predicates(),
        }
    }
}

impl Interpreter for SldInterpreter {
    fn consult(&mut self, module_tag: &str, program: &Program) -> Result<ConsultReport, InterpreterError> {
        self.check_program(program)?;
        Ok(self.add_program(module_tag, program))
    }

    fn unload_module(&mut self, module_tag: &str) -> usize {
        self.db.remove_module(module_tag)
    }

    fn replace_module(
        &mut self,
        module_tag: &str,
        program: &Program,
    ) -> Result<ConsultReport, InterpreterError> {
        // Validate first so a rejected program leaves the old clauses in place.
        self.check_program(program)?;
        self.db.remove_module(module_tag);
        Ok(self.add_program(module_tag, program))
    }

    fn solve(
        &mut self,
        goal: &Term,
        var_count: usize,
        limits: &QueryLimits,
    ) -> Result<SolveOutcome, InterpreterError> {
        if limits.max_solutions == Some(0) {
            return Ok(SolveOutcome::default());
        }
        let mut answers: Vec<Answer> = Vec::new();
        let mut machine = Machine::new(&mut self.db, limits, var_count);
        let max = limits.max_solutions;
        machine.solve(goal, &mut |b: &Bindings| {
            let answer = (0..var_count)
                .map(|v| {
                    let value = b.resolve(&Term::Var(v));
                    (!value.is_var()).then_some(value)
                })
                .collect();
            answers.push(answer);
            max.map_or(true, |m| answers.len() < m)
        })?;
        Ok(SolveOutcome {
            answers,
            mutated: std::mem::take(&mut machine.mutated),
            inferences: machine.inferences,
        })
    }

    fn assert_clause(&mut self, clause: &Term, at_end: bool) -> Result<PredKey, InterpreterError> {
        let limits = QueryLimits::default();
        let (normalized, var_count) = normalize_vars(clause);
        let mut machine = Machine::new(&mut self.db, &limits, var_count);
        machine.assert_term(&normalized, at_end)
    }

    fn retract_all(&mut self, head: &Term) -> Result<usize, InterpreterError> {
        let limits = QueryLimits::default();
        let (normalized, var_count) = normalize_vars(head);
        let mut machine = Machine::new(&mut self.db, &limits, var_count);
        machine.retract_all(&normalized)
    }

    fn declare_dynamic(&mut self, key: &PredKey) {
        self.db.declare_dynamic(key);
    }

    fn matching_facts(&mut self, head: &Term) -> Result<Vec<Term>, InterpreterError> {
        let limits = QueryLimits::default();
        let (normalized, var_count) = normalize_vars(head);
        let mut machine = Machine::new(&mut self.db, &limits, var_count);
        machine.matching_facts(&normalized)
    }

    fn dependencies(&self, goal: &Term) -> Option<BTreeSet<PredKey>> {
        let refs = goal_refs(goal);
        if refs.opaque {
            return None;
        }
        self.db.reachable(&refs.preds)
    }

    fn impure_predicates(&self) -> BTreeSet<PredKey> {
        self.db.impure()
    }
}

impl SldInterpreter {
    /// Parses `text` and consults it under `module_tag`.
    pub fn consult_text(&mut self, module_tag: &str, text: &str) -> Result<ConsultReport, InterpreterError> {
        let program = Program::parse(text)?;
        self.consult(module_tag, &program)
    }

    /// Number of clauses currently stored for `key`.
    pub fn clause_count(&self, key: &PredKey) -> usize {
        self.db.lookup(key).map_or(0, |pred| pred.clauses.len())
    }
}
