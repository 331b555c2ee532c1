//! Per-session query result cache.
//!
//! Entries are keyed by the canonical goal text and the solution limit, and
//! remember which predicates the goal reads. Writes are tracked twice: when a
//! write is submitted its predicates are invalidated and marked pending, and
//! when it has executed they are invalidated again and released. A result is
//! not inserted while a pending write touches one of its dependencies, so a
//! reader queued ahead of a writer never repopulates a stale entry.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::term::PredKey;

use super::QueryResult;

/// Counters reported by `AdapterSession::cache_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Predicates a write may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteScope {
    Keys(BTreeSet<PredKey>),
    /// Unknown extent: module changes and goals that may mutate anything.
    Global,
}

/// Receipt for a registered write; hand it back to `finish_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteTicket {
    id: u64,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    result: QueryResult,
    deps: BTreeSet<PredKey>,
    last_used: u64,
}

#[derive(Debug)]
pub(crate) struct QueryCache {
    capacity: usize,
    entries: HashMap<String, Entry>,
    pending: HashMap<u64, WriteScope>,
    next_ticket: u64,
    generation: u64,
    clock: u64,
    stats: CacheStats,
}

impl QueryCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            pending: HashMap::new(),
            next_ticket: 0,
            generation: 0,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub(crate) fn cache_key(canonical_goal: &str, max_solutions: Option<usize>) -> String {
        match max_solutions {
            Some(n) => format!("{canonical_goal}#{n}"),
            None => format!("{canonical_goal}#all"),
        }
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    pub(crate) fn lookup(&mut self, key: &str) -> Option<QueryResult> {
        self.clock += 1;
        let clock = self.clock;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = clock;
                self.stats.hits += 1;
                Some(entry.result.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Stores `result` unless the cache was reset since `generation` or a
    /// pending write overlaps `deps`.
    pub(crate) fn insert(&mut self, key: String, result: QueryResult, deps: BTreeSet<PredKey>, generation: u64) {
        if self.capacity == 0 || generation != self.generation || self.blocked(&deps) {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.clock += 1;
        self.entries.insert(
            key,
            Entry {
                result,
                deps,
                last_used: self.clock,
            },
        );
        self.stats.inserts += 1;
    }

    pub(crate) fn begin_write(&mut self, scope: WriteScope) -> WriteTicket {
        self.apply_scope(&scope);
        self.next_ticket += 1;
        let ticket = WriteTicket {
            id: self.next_ticket,
            generation: self.generation,
        };
        self.pending.insert(ticket.id, scope);
        ticket
    }

    /// Releases a write once it has executed. `mutated` lists predicates the
    /// write actually changed, which may reach beyond its declared scope.
    pub(crate) fn finish_write(&mut self, ticket: WriteTicket, mutated: &BTreeSet<PredKey>) {
        if ticket.generation != self.generation {
            return;
        }
        if let Some(scope) = self.pending.remove(&ticket.id) {
            self.apply_scope(&scope);
        }
        self.invalidate(mutated);
    }

    /// Drops entries that read any of `keys`.
    pub(crate) fn invalidate(&mut self, keys: &BTreeSet<PredKey>) {
        if keys.is_empty() {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.deps.is_disjoint(keys));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, predicates = keys.len(), "query cache entries invalidated");
        }
        self.stats.invalidations += removed as u64;
    }

    pub(crate) fn clear(&mut self) {
        self.stats.invalidations += self.entries.len() as u64;
        self.entries.clear();
    }

    /// Forgets everything, including pending writes, and starts a new generation.
    pub(crate) fn reset(&mut self) {
        self.clear();
        self.pending.clear();
        self.generation += 1;
    }

    fn apply_scope(&mut self, scope: &WriteScope) {
        match scope {
            WriteScope::Keys(keys) => self.invalidate(keys),
            WriteScope::Global => self.clear(),
        }
    }

    fn blocked(&self, deps: &BTreeSet<PredKey>) -> bool {
        self.pending.values().any(|scope| match scope {
            WriteScope::Keys(keys) => !keys.is_disjoint(deps),
            WriteScope::Global => true,
        })
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }
}
