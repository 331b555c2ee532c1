//! Clause database for the built-in resolver.
//!
//! Each predicate keeps its clauses behind an `Arc<Vec<_>>`. A running call
//! holds a clone of that `Arc`, so asserting or retracting while a predicate is
//! being enumerated copies the list instead of disturbing the enumeration
//! (logical update view).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::term::{PredKey, Term};

use super::program::ProgramClause;

#[derive(Debug)]
pub(crate) struct StoredClause {
    pub head: Term,
    pub body: Term,
    pub var_count: usize,
    pub module: Option<Arc<str>>,
    pub id: u64,
}

pub(crate) type ClauseList = Arc<Vec<Arc<StoredClause>>>;

#[derive(Debug, Default)]
pub(crate) struct Predicate {
    pub clauses: ClauseList,
    pub dynamic: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Database {
    preds: HashMap<PredKey, Predicate>,
    locked: BTreeSet<PredKey>,
    next_id: u64,
}

impl Database {
    pub fn add(&mut self, clause: ProgramClause, module: Option<&str>, at_end: bool) -> PredKey {
        let key = clause.key();
        let stored = Arc::new(StoredClause {
            head: clause.head,
            body: clause.body,
            var_count: clause.var_count,
            module: module.map(Arc::from),
            id: self.next_id,
        });
        self.next_id += 1;
        let pred = self.preds.entry(key.clone()).or_default();
        let list = Arc::make_mut(&mut pred.clauses);
        if at_end {
            list.push(stored);
        } else {
            list.insert(0, stored);
        }
        key
    }

    pub fn declare_dynamic(&mut self, key: &PredKey) {
        self.preds.entry(key.clone()).or_default().dynamic = true;
    }

    pub fn lookup(&self, key: &PredKey) -> Option<&Predicate> {
        self.preds.get(key)
    }

    pub fn contains(&self, key: &PredKey) -> bool {
        self.preds.contains_key(key)
    }

    /// Marks the currently defined predicates as library code that user
    /// programs may not extend.
    pub fn lock_all(&mut self) {
        self.locked.extend(self.preds.keys().cloned());
    }

    pub fn is_locked(&self, key: &PredKey) -> bool {
        self.locked.contains(key)
    }

    /// Removes every clause tagged `module`. Predicates left empty and not
    /// declared dynamic elsewhere disappear entirely.
    pub fn remove_module(&mut self, module: &str) -> usize {
        let mut removed = 0;
        for pred in self.preds.values_mut() {
            let before = pred.clauses.len();
            if pred
                .clauses
                .iter()
                .any(|c| c.module.as_deref() == Some(module))
            {
                Arc::make_mut(&mut pred.clauses).retain(|c| c.module.as_deref() != Some(module));
            }
            removed += before - pred.clauses.len();
        }
        self.preds
            .retain(|_, pred| pred.dynamic || !pred.clauses.is_empty());
        removed
    }

    /// Removes the clause with `id`. Returns whether it was present.
    pub fn remove_clause(&mut self, key: &PredKey, id: u64) -> bool {
        let Some(pred) = self.preds.get_mut(key) else {
            return false;
        };
        let before = pred.clauses.len();
        if pred.clauses.iter().any(|c| c.id == id) {
            Arc::make_mut(&mut pred.clauses).retain(|c| c.id != id);
        }
        before != pred.clauses.len()
    }

    /// Every predicate reachable from `roots` through clause bodies, or `None`
    /// when some reachable body calls a goal that is only known at run time.
    pub fn reachable(&self, roots: &BTreeSet<PredKey>) -> Option<BTreeSet<PredKey>> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<PredKey> = roots.iter().cloned().collect();
        while let Some(key) = stack.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(pred) = self.preds.get(&key) {
                for clause in pred.clauses.iter() {
                    let refs = super::goal_refs(&clause.body);
                    if refs.opaque {
                        return None;
                    }
                    stack.extend(refs.preds.into_iter().filter(|r| !seen.contains(r)));
                }
            }
        }
        Some(seen)
    }

    /// Predicates whose bodies can reach a mutation builtin, or a goal only
    /// known at run time (which might be one).
    pub fn impure(&self) -> BTreeSet<PredKey> {
        let mut direct: BTreeSet<PredKey> = BTreeSet::new();
        let mut callers: HashMap<PredKey, BTreeSet<PredKey>> = HashMap::new();
        for (key, pred) in &self.preds {
            for clause in pred.clauses.iter() {
                let refs = super::goal_refs(&clause.body);
                if refs.mutating || refs.opaque {
                    direct.insert(key.clone());
                }
                for callee in refs.preds {
                    callers.entry(callee).or_default().insert(key.clone());
                }
            }
        }
        let mut impure = BTreeSet::new();
        let mut stack: Vec<PredKey> = direct.into_iter().collect();
        while let Some(key) = stack.pop() {
            if !impure.insert(key.clone()) {
                continue;
            }
            if let Some(up) = callers.get(&key) {
                stack.extend(up.iter().filter(|k| !impure.contains(*k)).cloned());
            }
        }
        impure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Program;

    fn db_with(text: &str, module: &str) -> Database {
        let mut db = Database::default();
        for clause in Program::parse(text).unwrap().clauses {
            db.add(clause, Some(module), true);
        }
        db
    }

    #[test]
    fn remove_module_only_touches_its_clauses() {
        let mut db = db_with("p(1). p(2). q(a).", "m1");
        for clause in Program::parse("p(3).").unwrap().clauses {
            db.add(clause, Some("m2"), true);
        }
        assert_eq!(db.remove_module("m1"), 3);
        let p = db.lookup(&PredKey::new("p", 1)).unwrap();
        assert_eq!(p.clauses.len(), 1);
        assert!(!db.contains(&PredKey::new("q", 1)));
    }

    #[test]
    fn snapshots_survive_mutation() {
        let mut db = db_with("p(1). p(2).", "m");
        let snapshot = Arc::clone(&db.lookup(&PredKey::new("p", 1)).unwrap().clauses);
        let first = snapshot[0].id;
        assert!(db.remove_clause(&PredKey::new("p", 1), first));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(db.lookup(&PredKey::new("p", 1)).unwrap().clauses.len(), 1);
    }

    #[test]
    fn reachable_and_impure_follow_bodies() {
        let db = db_with(
            "a :- b, c. b :- d. c. d. log(X) :- assertz(seen(X)). note(X) :- log(X). \
             apply(G) :- call(G).",
            "m",
        );
        let reach = db.reachable(&BTreeSet::from([PredKey::new("a", 0)])).unwrap();
        assert!(reach.contains(&PredKey::new("d", 0)));
        assert!(!reach.contains(&PredKey::new("log", 1)));
        assert!(db
            .reachable(&BTreeSet::from([PredKey::new("apply", 1)]))
            .is_none());

        let impure = db.impure();
        assert!(impure.contains(&PredKey::new("log", 1)));
        assert!(impure.contains(&PredKey::new("note", 1)));
        assert!(impure.contains(&PredKey::new("apply", 1)));
        assert!(!impure.contains(&PredKey::new("a", 0)));
    }
}
