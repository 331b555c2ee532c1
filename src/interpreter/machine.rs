//! SLD resolution with chronological backtracking.
//!
//! Bindings live in one cell vector shared by the query and every renamed
//! clause. Each choicepoint remembers the trail and cell heights; backtracking
//! undoes trailed bindings and drops cells allocated since. The continuation is
//! a shared linked list of frames, so choicepoints capture it by cloning an
//! `Rc`.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use crate::term::{rebuild, PredKey, Term, VarId, Visit};

use super::builtins;
use super::database::{ClauseList, Database};
use super::program::{split_clause, ProgramClause};
use super::{InterpreterError, QueryLimits};

/// Resolution steps between deadline and abort checks.
const POLL_INTERVAL: u64 = 128;

/// Maximum depth of nested sub-proofs (`findall/3` inside `findall/3` ...).
const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mark {
    trail: usize,
    cells: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Bindings {
    cells: Vec<Option<Term>>,
    trail: Vec<VarId>,
}

impl Bindings {
    pub fn with_vars(count: usize) -> Self {
        Self {
            cells: vec![None; count],
            trail: Vec::new(),
        }
    }

    /// Reserves `count` fresh variables and returns the first id.
    pub fn alloc(&mut self, count: usize) -> VarId {
        let base = self.cells.len();
        self.cells.resize(base + count, None);
        base
    }

    pub fn fresh(&mut self) -> Term {
        Term::Var(self.alloc(1))
    }

    pub fn mark(&self) -> Mark {
        Mark {
            trail: self.trail.len(),
            cells: self.cells.len(),
        }
    }

    pub fn restore(&mut self, mark: Mark) {
        while self.trail.len() > mark.trail {
            if let Some(var) = self.trail.pop() {
                if let Some(cell) = self.cells.get_mut(var) {
                    *cell = None;
                }
            }
        }
        self.cells.truncate(mark.cells);
    }

    /// Follows variable bindings until an unbound variable or a non-variable.
    pub fn deref<'a>(&'a self, mut term: &'a Term) -> &'a Term {
        while let Term::Var(v) = term {
            match self.cells.get(*v) {
                Some(Some(bound)) => term = bound,
                _ => break,
            }
        }
        term
    }

    fn bind(&mut self, var: VarId, value: Term) {
        if var >= self.cells.len() {
            self.cells.resize(var + 1, None);
        }
        self.cells[var] = Some(value);
        self.trail.push(var);
    }

    /// Applies the current substitution all the way down.
    pub fn resolve<'a>(&'a self, term: &'a Term) -> Term {
        rebuild(term, |node| match self.deref(node) {
            Term::Compound(name, args) => Visit::Descend(name, args),
            other => Visit::Replace(other.clone()),
        })
    }

    /// Unifies without occurs check. On failure the caller restores a mark.
    pub fn unify(&mut self, a: &Term, b: &Term) -> bool {
        let mut pending = vec![(a.clone(), b.clone())];
        while let Some((x, y)) = pending.pop() {
            let mut x = self.deref(&x).clone();
            let mut y = self.deref(&y).clone();
            match (var_id(&x), var_id(&y)) {
                (Some(i), Some(j)) => {
                    // Younger variables point at older ones.
                    if i > j {
                        self.bind(i, Term::Var(j));
                    } else if j > i {
                        self.bind(j, Term::Var(i));
                    }
                    continue;
                }
                (Some(i), None) => {
                    self.bind(i, y);
                    continue;
                }
                (None, Some(j)) => {
                    self.bind(j, x);
                    continue;
                }
                (None, None) => {}
            }
            let same = match (&mut x, &mut y) {
                (Term::Atom(p), Term::Atom(q)) | (Term::Str(p), Term::Str(q)) => p == q,
                (Term::Int(p), Term::Int(q)) => p == q,
                (Term::Float(p), Term::Float(q)) => p.to_bits() == q.to_bits(),
                (Term::Compound(f, xs), Term::Compound(g, ys)) if f == g && xs.len() == ys.len() => {
                    let (xs, ys) = (std::mem::take(xs), std::mem::take(ys));
                    pending.extend(xs.into_iter().zip(ys).rev());
                    true
                }
                _ => false,
            };
            if !same {
                return false;
            }
        }
        true
    }

    /// Copy of a resolved term with its variables replaced by fresh ones.
    pub fn copy_fresh(&mut self, term: &Term) -> Term {
        let mut renamed: HashMap<VarId, Term> = HashMap::new();
        term.map_vars(&mut |v| {
            renamed
                .entry(v)
                .or_insert_with(|| Term::Var(self.alloc(1)))
                .clone()
        })
    }
}

struct Frame {
    goal: Term,
    barrier: usize,
    next: Cont,
}

type Cont = Option<Rc<Frame>>;

impl Drop for Frame {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(frame) = next {
            match Rc::try_unwrap(frame) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_) => break,
            }
        }
    }
}

fn push(goal: Term, barrier: usize, next: Cont) -> Cont {
    Some(Rc::new(Frame {
        goal,
        barrier,
        next,
    }))
}

fn push_body(body: Term, barrier: usize, next: Cont) -> Cont {
    match &body {
        Term::Atom(name) if name == "true" => next,
        _ => push(body, barrier, next),
    }
}

fn var_id(term: &Term) -> Option<VarId> {
    match term {
        Term::Var(v) => Some(*v),
        _ => None,
    }
}

fn rename(term: &Term, offset: VarId) -> Term {
    term.map_vars(&mut |v| Term::Var(v + offset))
}

#[allow(clippy::cast_possible_wrap)]
fn marker(name: &str, height: usize) -> Term {
    Term::Compound(name.to_string(), vec![Term::Int(height as i64)])
}

fn marker_height(args: &[Term]) -> Option<usize> {
    match args.first() {
        Some(Term::Int(h)) => usize::try_from(*h).ok(),
        _ => None,
    }
}

enum Alt {
    Goal { goal: Term, barrier: usize },
    Clauses { goal: Term, clauses: ClauseList, next: usize },
    Between { var: Term, next: i64, high: Option<i64> },
    Fail,
}

struct ChoicePoint {
    mark: Mark,
    cont: Cont,
    alt: Alt,
}

enum Step {
    Continue(Cont),
    Fail,
}

pub(crate) struct Machine<'a> {
    pub db: &'a mut Database,
    pub bindings: Bindings,
    limits: &'a QueryLimits,
    pub inferences: u64,
    pub mutated: BTreeSet<PredKey>,
    nesting: usize,
}

impl<'a> Machine<'a> {
    pub fn new(db: &'a mut Database, limits: &'a QueryLimits, var_count: usize) -> Self {
        Self {
            db,
            bindings: Bindings::with_vars(var_count),
            limits,
            inferences: 0,
            mutated: BTreeSet::new(),
            nesting: 0,
        }
    }

    /// Proves `goal`, calling `on_answer` for each solution until it returns
    /// `false` or the search space is exhausted.
    pub fn solve(
        &mut self,
        goal: &Term,
        on_answer: &mut dyn FnMut(&Bindings) -> bool,
    ) -> Result<(), InterpreterError> {
        if self.nesting >= MAX_NESTING {
            return Err(InterpreterError::ResourceExhausted {
                message: format!("sub-proofs nested deeper than {MAX_NESTING}"),
            });
        }
        self.nesting += 1;
        let result = self.run(goal.clone(), on_answer);
        self.nesting -= 1;
        result
    }

    fn run(
        &mut self,
        goal: Term,
        on_answer: &mut dyn FnMut(&Bindings) -> bool,
    ) -> Result<(), InterpreterError> {
        let mut cps: Vec<ChoicePoint> = Vec::new();
        let mut cont = push(goal, 0, None);
        loop {
            let step = match cont.take() {
                None => {
                    if !on_answer(&self.bindings) {
                        return Ok(());
                    }
                    Step::Fail
                }
                Some(frame) => {
                    self.tick()?;
                    self.step(&frame.goal, frame.barrier, frame.next.clone(), &mut cps)?
                }
            };
            cont = match step {
                Step::Continue(next) => next,
                Step::Fail => match self.backtrack(&mut cps)? {
                    Some(next) => next,
                    None => return Ok(()),
                },
            };
        }
    }

    fn tick(&mut self) -> Result<(), InterpreterError> {
        self.inferences += 1;
        if let Some(max) = self.limits.max_inferences {
            if self.inferences > max {
                return Err(InterpreterError::ResourceExhausted {
                    message: format!("inference limit of {max} reached"),
                });
            }
        }
        if self.inferences % POLL_INTERVAL == 0 {
            if let Some(abort) = &self.limits.abort {
                if abort.load(AtomicOrdering::Relaxed) {
                    return Err(InterpreterError::Timeout);
                }
            }
            if let Some(deadline) = self.limits.deadline {
                if Instant::now() >= deadline {
                    return Err(InterpreterError::Timeout);
                }
            }
        }
        Ok(())
    }

    fn backtrack(&mut self, cps: &mut Vec<ChoicePoint>) -> Result<Option<Cont>, InterpreterError> {
        while let Some(cp) = cps.pop() {
            self.bindings.restore(cp.mark);
            match cp.alt {
                Alt::Fail => {}
                Alt::Goal { goal, barrier } => return Ok(Some(push(goal, barrier, cp.cont))),
                Alt::Clauses {
                    goal,
                    clauses,
                    next,
                } => {
                    self.tick()?;
                    if let Some(found) = self.try_clauses(&goal, clauses, next, cp.cont, cps) {
                        return Ok(Some(found));
                    }
                }
                Alt::Between { var, next, high } => {
                    if high.map_or(true, |h| next < h) {
                        cps.push(ChoicePoint {
                            mark: self.bindings.mark(),
                            cont: cp.cont.clone(),
                            alt: Alt::Between {
                                var: var.clone(),
                                next: next + 1,
                                high,
                            },
                        });
                    }
                    if self.bindings.unify(&var, &Term::Int(next)) {
                        return Ok(Some(cp.cont));
                    }
                }
            }
        }
        Ok(None)
    }

    fn step(
        &mut self,
        goal: &Term,
        barrier: usize,
        next: Cont,
        cps: &mut Vec<ChoicePoint>,
    ) -> Result<Step, InterpreterError> {
        let goal = self.bindings.deref(goal).clone();
        let (name, args): (&str, &[Term]) = match &goal {
            Term::Atom(name) => (name.as_str(), &[][..]),
            Term::Compound(name, args) => (name.as_str(), args.as_slice()),
            Term::Var(_) => {
                return Err(InterpreterError::Instantiation {
                    context: "call/1".to_string(),
                })
            }
            other => {
                return Err(InterpreterError::Type {
                    expected: "callable".to_string(),
                    culprit: other.to_canonical(),
                })
            }
        };
        let step = match (name, args.len()) {
            ("true", 0) => Step::Continue(next),
            ("fail" | "false", 0) => Step::Fail,
            ("!", 0) => {
                cps.truncate(barrier);
                Step::Continue(next)
            }
            ("$cut", 1) => {
                if let Some(height) = marker_height(args) {
                    cps.truncate(height);
                }
                Step::Continue(next)
            }
            ("$softcut", 1) => {
                if let Some(cp) = marker_height(args).and_then(|h| cps.get_mut(h)) {
                    cp.alt = Alt::Fail;
                }
                Step::Continue(next)
            }
            (",", 2) => Step::Continue(push(
                args[0].clone(),
                barrier,
                push(args[1].clone(), barrier, next),
            )),
            (";", 2) => {
                let lhs = self.bindings.deref(&args[0]).clone();
                match &lhs {
                    Term::Compound(op, parts) if op == "->" && parts.len() == 2 => self.if_then_else(
                        parts[0].clone(),
                        parts[1].clone(),
                        args[1].clone(),
                        barrier,
                        next,
                        cps,
                    ),
                    Term::Compound(op, parts) if op == "*->" && parts.len() == 2 => {
                        let height = cps.len();
                        cps.push(ChoicePoint {
                            mark: self.bindings.mark(),
                            cont: next.clone(),
                            alt: Alt::Goal {
                                goal: args[1].clone(),
                                barrier,
                            },
                        });
                        Step::Continue(push(
                            parts[0].clone(),
                            height + 1,
                            push(
                                marker("$softcut", height),
                                barrier,
                                push(parts[1].clone(), barrier, next),
                            ),
                        ))
                    }
                    _ => {
                        cps.push(ChoicePoint {
                            mark: self.bindings.mark(),
                            cont: next.clone(),
                            alt: Alt::Goal {
                                goal: args[1].clone(),
                                barrier,
                            },
                        });
                        Step::Continue(push(lhs, barrier, next))
                    }
                }
            }
            ("->", 2) => self.if_then_else(
                args[0].clone(),
                args[1].clone(),
                Term::atom("fail"),
                barrier,
                next,
                cps,
            ),
            ("*->", 2) => Step::Continue(push(
                args[0].clone(),
                cps.len(),
                push(args[1].clone(), barrier, next),
            )),
            ("\\+" | "not", 1) => self.if_then_else(
                args[0].clone(),
                Term::atom("fail"),
                Term::atom("true"),
                barrier,
                next,
                cps,
            ),
            ("once", 1) => self.if_then_else(
                args[0].clone(),
                Term::atom("true"),
                Term::atom("fail"),
                barrier,
                next,
                cps,
            ),
            ("ignore", 1) => self.if_then_else(
                args[0].clone(),
                Term::atom("true"),
                Term::atom("true"),
                barrier,
                next,
                cps,
            ),
            ("forall", 2) => {
                let counter = Term::Compound(
                    ",".to_string(),
                    vec![
                        args[0].clone(),
                        Term::Compound("\\+".to_string(), vec![args[1].clone()]),
                    ],
                );
                self.if_then_else(
                    counter,
                    Term::atom("fail"),
                    Term::atom("true"),
                    barrier,
                    next,
                    cps,
                )
            }
            ("call", n) if n >= 1 => {
                let target = self.bindings.deref(&args[0]).clone();
                let called = add_args(target, &args[1..])?;
                Step::Continue(push(called, cps.len(), next))
            }
            ("findall", 3) => {
                let items = self.findall(&args[0], &args[1])?;
                self.unify_step(&args[2], &Term::list(items), next)
            }
            ("findall", 4) => {
                let items = self.findall(&args[0], &args[1])?;
                let list = Term::list_with_tail(items, args[3].clone());
                self.unify_step(&args[2], &list, next)
            }
            ("between", 3) => self.between(args, next, cps)?,
            ("assert" | "assertz", 1) => {
                self.assert_term(&args[0], true)?;
                Step::Continue(next)
            }
            ("asserta", 1) => {
                self.assert_term(&args[0], false)?;
                Step::Continue(next)
            }
            ("retract", 1) => {
                if self.retract(&args[0])? {
                    Step::Continue(next)
                } else {
                    Step::Fail
                }
            }
            ("retractall", 1) => {
                self.retract_all(&args[0])?;
                Step::Continue(next)
            }
            _ => match builtins::call(self, name, args) {
                Some(Ok(true)) => Step::Continue(next),
                Some(Ok(false)) => Step::Fail,
                Some(Err(err)) => return Err(err),
                None => self.call_user(&goal, name, args.len(), next, cps)?,
            },
        };
        Ok(step)
    }

    fn call_user(
        &mut self,
        goal: &Term,
        name: &str,
        arity: usize,
        next: Cont,
        cps: &mut Vec<ChoicePoint>,
    ) -> Result<Step, InterpreterError> {
        let key = PredKey::new(name, arity);
        let Some(pred) = self.db.lookup(&key) else {
            return Err(InterpreterError::Existence {
                predicate: key.to_string(),
            });
        };
        let clauses = Arc::clone(&pred.clauses);
        Ok(match self.try_clauses(goal, clauses, 0, next, cps) {
            Some(cont) => Step::Continue(cont),
            None => Step::Fail,
        })
    }

    /// Tries clauses from `start`; leaves a choicepoint only when a later
    /// clause could still match on its first argument.
    fn try_clauses(
        &mut self,
        goal: &Term,
        clauses: ClauseList,
        start: usize,
        cont: Cont,
        cps: &mut Vec<ChoicePoint>,
    ) -> Option<Cont> {
        let height = cps.len();
        let first = goal.args().first().map(|a| self.bindings.deref(a).clone());
        let candidate = |from: usize| {
            (from..clauses.len()).find(|idx| {
                first_arg_compatible(first.as_ref(), clauses[*idx].head.args().first())
            })
        };
        let mut idx = candidate(start)?;
        loop {
            let clause = Arc::clone(&clauses[idx]);
            let following = candidate(idx + 1);
            let mark = self.bindings.mark();
            let offset = self.bindings.alloc(clause.var_count);
            let head = rename(&clause.head, offset);
            if self.bindings.unify(goal, &head) {
                if let Some(later) = following {
                    cps.push(ChoicePoint {
                        mark,
                        cont: cont.clone(),
                        alt: Alt::Clauses {
                            goal: goal.clone(),
                            clauses: Arc::clone(&clauses),
                            next: later,
                        },
                    });
                }
                return Some(push_body(rename(&clause.body, offset), height, cont));
            }
            self.bindings.restore(mark);
            idx = following?;
        }
    }

    fn if_then_else(
        &mut self,
        cond: Term,
        then: Term,
        otherwise: Term,
        barrier: usize,
        next: Cont,
        cps: &mut Vec<ChoicePoint>,
    ) -> Step {
        let height = cps.len();
        cps.push(ChoicePoint {
            mark: self.bindings.mark(),
            cont: next.clone(),
            alt: Alt::Goal {
                goal: otherwise,
                barrier,
            },
        });
        Step::Continue(push(
            cond,
            height + 1,
            push(marker("$cut", height), barrier, push(then, barrier, next)),
        ))
    }

    fn unify_step(&mut self, a: &Term, b: &Term, next: Cont) -> Step {
        if self.bindings.unify(a, b) {
            Step::Continue(next)
        } else {
            Step::Fail
        }
    }

    fn between(
        &mut self,
        args: &[Term],
        next: Cont,
        cps: &mut Vec<ChoicePoint>,
    ) -> Result<Step, InterpreterError> {
        let low = builtins::int_arg(&self.bindings, &args[0], "between/3")?;
        let high = match self.bindings.deref(&args[1]) {
            Term::Atom(name) if name == "inf" || name == "infinite" => None,
            _ => Some(builtins::int_arg(&self.bindings, &args[1], "between/3")?),
        };
        let value = self.bindings.deref(&args[2]).clone();
        match value {
            Term::Int(v) => Ok(if v >= low && high.map_or(true, |h| v <= h) {
                Step::Continue(next)
            } else {
                Step::Fail
            }),
            Term::Var(_) => {
                if high.is_some_and(|h| low > h) {
                    return Ok(Step::Fail);
                }
                if high.map_or(true, |h| low < h) {
                    cps.push(ChoicePoint {
                        mark: self.bindings.mark(),
                        cont: next.clone(),
                        alt: Alt::Between {
                            var: value.clone(),
                            next: low + 1,
                            high,
                        },
                    });
                }
                Ok(self.unify_step(&value, &Term::Int(low), next))
            }
            other => Err(InterpreterError::Type {
                expected: "integer".to_string(),
                culprit: other.to_canonical(),
            }),
        }
    }

    /// Collects resolved copies of `template` for every proof of `goal`.
    pub fn findall(&mut self, template: &Term, goal: &Term) -> Result<Vec<Term>, InterpreterError> {
        let goal = self.bindings.resolve(goal);
        let template = self.bindings.resolve(template);
        let mark = self.bindings.mark();
        let mut found = Vec::new();
        let result = self.solve(&goal, &mut |b: &Bindings| {
            found.push(b.resolve(&template));
            true
        });
        self.bindings.restore(mark);
        result?;
        Ok(found
            .iter()
            .map(|item| self.bindings.copy_fresh(item))
            .collect())
    }

    pub fn assert_term(&mut self, clause: &Term, at_end: bool) -> Result<PredKey, InterpreterError> {
        let (term, var_count) = normalize_vars(&self.bindings.resolve(clause));
        let clause = ProgramClause::from_term(term, var_count)?;
        let key = clause.key();
        self.check_modifiable(&key)?;
        self.db.declare_dynamic(&key);
        self.db.add(clause, None, at_end);
        self.mutated.insert(key.clone());
        Ok(key)
    }

    /// Removes the first clause matching `clause`, keeping its bindings.
    fn retract(&mut self, clause: &Term) -> Result<bool, InterpreterError> {
        let resolved = self.bindings.resolve(clause);
        let (head, body) = split_clause(resolved);
        let key = self.head_key(&head, "retract/1")?;
        self.check_modifiable(&key)?;
        let Some(pred) = self.db.lookup(&key) else {
            return Ok(false);
        };
        let clauses = Arc::clone(&pred.clauses);
        for stored in clauses.iter() {
            let mark = self.bindings.mark();
            let offset = self.bindings.alloc(stored.var_count);
            if self.bindings.unify(&head, &rename(&stored.head, offset))
                && self.bindings.unify(&body, &rename(&stored.body, offset))
            {
                self.db.remove_clause(&key, stored.id);
                self.mutated.insert(key);
                return Ok(true);
            }
            self.bindings.restore(mark);
        }
        Ok(false)
    }

    /// Removes every clause whose head unifies with `head`.
    pub fn retract_all(&mut self, head: &Term) -> Result<usize, InterpreterError> {
        let head = self.bindings.resolve(head);
        let key = self.head_key(&head, "retractall/1")?;
        self.check_modifiable(&key)?;
        self.db.declare_dynamic(&key);
        let Some(pred) = self.db.lookup(&key) else {
            return Ok(0);
        };
        let clauses = Arc::clone(&pred.clauses);
        let mut doomed = Vec::new();
        for stored in clauses.iter() {
            let mark = self.bindings.mark();
            let offset = self.bindings.alloc(stored.var_count);
            if self.bindings.unify(&head, &rename(&stored.head, offset)) {
                doomed.push(stored.id);
            }
            self.bindings.restore(mark);
        }
        for id in &doomed {
            self.db.remove_clause(&key, *id);
        }
        self.mutated.insert(key);
        Ok(doomed.len())
    }

    /// Heads of stored facts that unify with `head`, as stored.
    pub fn matching_facts(&mut self, head: &Term) -> Result<Vec<Term>, InterpreterError> {
        let key = self.head_key(head, "matching_facts")?;
        let Some(pred) = self.db.lookup(&key) else {
            return Ok(Vec::new());
        };
        let clauses = Arc::clone(&pred.clauses);
        let mut facts = Vec::new();
        for stored in clauses.iter() {
            if !matches!(&stored.body, Term::Atom(name) if name == "true") {
                continue;
            }
            let mark = self.bindings.mark();
            let offset = self.bindings.alloc(stored.var_count);
            if self.bindings.unify(head, &rename(&stored.head, offset)) {
                facts.push(stored.head.clone());
            }
            self.bindings.restore(mark);
        }
        Ok(facts)
    }

    fn head_key(&self, head: &Term, context: &str) -> Result<PredKey, InterpreterError> {
        match self.bindings.deref(head) {
            Term::Var(_) => Err(InterpreterError::Instantiation {
                context: context.to_string(),
            }),
            other => other.pred_key().ok_or_else(|| InterpreterError::Type {
                expected: "callable".to_string(),
                culprit: other.to_canonical(),
            }),
        }
    }

    fn check_modifiable(&self, key: &PredKey) -> Result<(), InterpreterError> {
        if builtins::is_builtin(&key.name, key.arity)
            || super::program::is_control(&key.name, key.arity)
            || self.db.is_locked(key)
        {
            return Err(InterpreterError::Permission {
                message: format!("cannot modify static procedure {key}"),
            });
        }
        Ok(())
    }
}

/// Cheap pre-check on first arguments so deterministic calls leave no
/// choicepoint behind.
fn first_arg_compatible(goal: Option<&Term>, head: Option<&Term>) -> bool {
    match (goal, head) {
        (None, _) | (_, None) | (Some(Term::Var(_)), _) | (_, Some(Term::Var(_))) => true,
        (Some(Term::Atom(a)), Some(Term::Atom(b))) | (Some(Term::Str(a)), Some(Term::Str(b))) => a == b,
        (Some(Term::Int(a)), Some(Term::Int(b))) => a == b,
        (Some(Term::Float(a)), Some(Term::Float(b))) => a.to_bits() == b.to_bits(),
        (Some(Term::Compound(f, xs)), Some(Term::Compound(g, ys))) => f == g && xs.len() == ys.len(),
        _ => false,
    }
}

/// Appends `extra` arguments to a callable term (`call/N`).
fn add_args(target: Term, extra: &[Term]) -> Result<Term, InterpreterError> {
    let other = match target.into_compound() {
        Ok((name, mut args)) => {
            args.extend_from_slice(extra);
            return Ok(Term::Compound(name, args));
        }
        Err(other) => other,
    };
    match &other {
        Term::Var(_) => Err(InterpreterError::Instantiation {
            context: "call/1".to_string(),
        }),
        Term::Atom(name) => Ok(Term::compound(name.as_str(), extra.to_vec())),
        _ => Err(InterpreterError::Type {
            expected: "callable".to_string(),
            culprit: other.to_canonical(),
        }),
    }
}

/// Renumbers the variables of a term densely from zero.
pub(crate) fn normalize_vars(term: &Term) -> (Term, usize) {
    let mut renamed: HashMap<VarId, VarId> = HashMap::new();
    let normalized = term.map_vars(&mut |v| {
        let next = renamed.len();
        Term::Var(*renamed.entry(v).or_insert(next))
    });
    (normalized, renamed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Program;
    use crate::term::parse_term;

    fn db(text: &str) -> Database {
        let mut db = Database::default();
        let program = Program::parse(text).unwrap();
        for key in &program.dynamic {
            db.declare_dynamic(key);
        }
        for clause in program.clauses {
            db.add(clause, Some("test"), true);
        }
        db
    }

    fn answers(db: &mut Database, goal: &str) -> Result<Vec<String>, InterpreterError> {
        let parsed = parse_term(goal).unwrap();
        let limits = QueryLimits::default();
        let mut machine = Machine::new(db, &limits, parsed.var_names.len());
        let mut out = Vec::new();
        let names = parsed.var_names.clone();
        machine.solve(&parsed.term, &mut |b: &Bindings| {
            let row: Vec<String> = (0..names.len())
                .map(|v| b.resolve(&Term::Var(v)).to_canonical())
                .collect();
            out.push(row.join(","));
            true
        })?;
        Ok(out)
    }

    #[test]
    fn backtracks_through_clauses_in_order() {
        let mut db = db("note(c). note(d). note(e).");
        assert_eq!(answers(&mut db, "note(X)").unwrap(), vec!["c", "d", "e"]);
    }

    #[test]
    fn cut_prunes_remaining_clauses() {
        let mut db = db("first(X) :- member_(X), !. member_(a). member_(b).");
        assert_eq!(answers(&mut db, "first(X)").unwrap(), vec!["a"]);
    }

    #[test]
    fn if_then_else_commits_to_first_condition_answer() {
        let mut db = db("n(1). n(2).");
        assert_eq!(
            answers(&mut db, "( n(X) -> Y = yes ; Y = no )").unwrap(),
            vec!["1,yes"]
        );
        assert_eq!(answers(&mut db, "( n(3) -> Y = yes ; Y = no )").unwrap(), vec!["no"]);
    }

    #[test]
    fn negation_and_disjunction() {
        let mut db = db("n(1). n(2).");
        assert_eq!(answers(&mut db, "\\+ n(3)").unwrap().len(), 1);
        assert!(answers(&mut db, "\\+ n(1)").unwrap().is_empty());
        assert_eq!(answers(&mut db, "( X = a ; X = b )").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn findall_and_between() {
        let mut db = db("n(1). n(2).");
        assert_eq!(
            answers(&mut db, "findall(X-Y, (n(X), between(1, X, Y)), L)").unwrap(),
            vec!["_G0,_G1,[-(1,1),-(2,1),-(2,2)]"]
        );
    }

    #[test]
    fn unknown_predicates_raise_existence_errors() {
        let mut db = db(":- dynamic seen/1.");
        assert!(answers(&mut db, "seen(x)").unwrap().is_empty());
        assert!(matches!(
            answers(&mut db, "missing(x)"),
            Err(InterpreterError::Existence { .. })
        ));
    }

    #[test]
    fn assert_and_retract_update_the_database() {
        let mut db = db("");
        assert_eq!(
            answers(&mut db, "assertz(seen(a)), assertz(seen(b)), retract(seen(a)), findall(X, seen(X), L)")
                .unwrap(),
            vec!["_G0,[b]"]
        );
    }

    #[test]
    fn deep_recursion_does_not_accumulate_choicepoints() {
        let mut db = db("count(N, N) :- !. count(I, N) :- I1 is I + 1, count(I1, N).");
        assert_eq!(answers(&mut db, "count(0, 50000)").unwrap().len(), 1);
    }

    #[test]
    fn deadline_interrupts_infinite_loops() {
        let mut db = db("spin :- spin.");
        let parsed = parse_term("spin").unwrap();
        let limits = QueryLimits {
            deadline: Some(Instant::now() + std::time::Duration::from_millis(20)),
            ..QueryLimits::default()
        };
        let mut machine = Machine::new(&mut db, &limits, 0);
        let err = machine.solve(&parsed.term, &mut |_: &Bindings| true).unwrap_err();
        assert_eq!(err, InterpreterError::Timeout);
    }

    #[test]
    fn inference_limit_is_enforced() {
        let mut db = db("spin :- spin.");
        let parsed = parse_term("spin").unwrap();
        let limits = QueryLimits {
            max_inferences: Some(1000),
            ..QueryLimits::default()
        };
        let mut machine = Machine::new(&mut db, &limits, 0);
        assert!(matches!(
            machine.solve(&parsed.term, &mut |_: &Bindings| true),
            Err(InterpreterError::ResourceExhausted { .. })
        ));
    }
}
