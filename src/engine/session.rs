//! Interpreter sessions.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, LogicError, LogicResult, ValidationError};
use crate::interpreter::{
    goal_refs, ConsultReport, Interpreter, InterpreterError, InterpreterFactory, Program,
    QueryLimits, SldFactory,
};
use crate::term::{parse_term, term_to_json, ParsedTerm, PredKey, Term};

use super::query_cache::{CacheStats, QueryCache, WriteScope, WriteTicket};
use super::result::duration_ms;
use super::worker::{SessionWorker, Task};
use super::{QueryError, QueryOptions, QueryResult, SessionConfig, SessionId, Solution};

/// Variable that receives the result list in `find_all`.
const FIND_ALL_VAR: &str = "KyroFindAllResults";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything needed to rebuild an interpreter after its worker is replaced.
#[derive(Debug, Clone, Default)]
struct Journal {
    modules: Vec<(String, Arc<Program>)>,
    dynamic: BTreeSet<PredKey>,
}

#[derive(Debug, Clone)]
enum JournalOp {
    Consult(String, Arc<Program>),
    Replace(String, Arc<Program>),
    Unload(String),
    Dynamic(PredKey),
}

impl Journal {
    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Consult(tag, program) => self.modules.push((tag, program)),
            JournalOp::Replace(tag, program) => {
                self.modules.retain(|(t, _)| *t != tag);
                self.modules.push((tag, program));
            }
            JournalOp::Unload(tag) => self.modules.retain(|(t, _)| *t != tag),
            JournalOp::Dynamic(key) => {
                self.dynamic.insert(key);
            }
        }
    }

    fn replay(&self, interp: &mut dyn Interpreter, session: SessionId) {
        for key in &self.dynamic {
            interp.declare_dynamic(key);
        }
        for (tag, program) in &self.modules {
            if let Err(err) = interp.consult(tag, program) {
                error!(session = %session, module = %tag, error = %err, "journal replay failed");
            }
        }
    }
}

struct Slot {
    worker: SessionWorker,
    generation: u64,
    /// Bumped by `reset`; module state kept outside the session keys off it.
    resets: u64,
    journal: Journal,
    /// Predicates that may assert or retract when called.
    impure: Arc<BTreeSet<PredKey>>,
}

/// Per-dispatch context handed to task builders.
struct Dispatch {
    generation: u64,
    abort: Arc<AtomicBool>,
}

struct SessionShared {
    me: Weak<SessionShared>,
    id: SessionId,
    config: SessionConfig,
    factory: Arc<dyn InterpreterFactory>,
    slot: Mutex<Slot>,
    cache: Arc<Mutex<QueryCache>>,
}

fn worker_label(id: SessionId, generation: u64) -> String {
    format!("{}-{generation}", id.short())
}

impl SessionShared {
    /// Queues a task on the current worker. A dead worker is replaced once.
    fn dispatch(
        &self,
        overdue_at: Option<Instant>,
        build: &mut dyn FnMut(&Dispatch) -> Task,
    ) -> Result<u64, ExecutionError> {
        let mut slot = lock(&self.slot);
        let ctx = Dispatch {
            generation: slot.generation,
            abort: slot.worker.abort_flag(),
        };
        match slot.worker.try_submit(build(&ctx), overdue_at) {
            Ok(()) => Ok(ctx.generation),
            Err(ExecutionError::Disconnected { .. }) => {
                self.recreate(&mut slot, "worker disconnected")?;
                let ctx = Dispatch {
                    generation: slot.generation,
                    abort: slot.worker.abort_flag(),
                };
                slot.worker.try_submit(build(&ctx), overdue_at)?;
                Ok(ctx.generation)
            }
            Err(err) => Err(err),
        }
    }

    fn submit_job<R, F>(&self, job: F) -> Result<(Receiver<R>, u64), ExecutionError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Interpreter, u64) -> R + Clone + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let overdue_at = Instant::now() + self.config.job_timeout();
        let generation = self.dispatch(Some(overdue_at), &mut |ctx: &Dispatch| {
            let job = job.clone();
            let tx = tx.clone();
            let generation = ctx.generation;
            let task: Task = Box::new(move |interp: &mut dyn Interpreter| {
                let _ = tx.send(job(interp, generation));
            });
            task
        })?;
        drop(tx);
        Ok((rx, generation))
    }

    fn await_job<R>(&self, rx: &Receiver<R>, generation: u64) -> Result<R, ExecutionError> {
        let timeout = self.config.job_timeout();
        rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => {
                self.on_overdue(generation, "job timed out");
                ExecutionError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            }
            RecvTimeoutError::Disconnected => {
                self.on_lost(generation);
                ExecutionError::Disconnected {
                    session: self.id.to_string(),
                }
            }
        })
    }

    fn run_job<R, F>(&self, job: F) -> Result<R, ExecutionError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Interpreter, u64) -> R + Clone + Send + 'static,
    {
        let (rx, generation) = self.submit_job(job)?;
        self.await_job(&rx, generation)
    }

    /// Records a journal entry and the refreshed impure set, unless the
    /// worker that produced them has been replaced.
    fn record(&self, generation: u64, op: Option<JournalOp>, impure: BTreeSet<PredKey>) -> bool {
        let mut slot = lock(&self.slot);
        if slot.generation != generation {
            return false;
        }
        if let Some(op) = op {
            slot.journal.apply(op);
        }
        slot.impure = Arc::new(impure);
        true
    }

    fn impure(&self) -> Arc<BTreeSet<PredKey>> {
        Arc::clone(&lock(&self.slot).impure)
    }

    /// Called when a caller stopped waiting. Replaces the worker only if it is
    /// still the one the caller used and its current job is past due.
    fn on_overdue(&self, generation: u64, reason: &str) {
        let mut slot = lock(&self.slot);
        if slot.generation == generation && slot.worker.is_overdue(Instant::now()) {
            if let Err(err) = self.recreate(&mut slot, reason) {
                error!(session = %self.id, error = %err, "failed to replace overdue worker");
            }
        }
    }

    /// Called when a reply channel closed without an answer.
    fn on_lost(&self, generation: u64) {
        let mut slot = lock(&self.slot);
        if slot.generation == generation {
            if let Err(err) = self.recreate(&mut slot, "worker lost") {
                error!(session = %self.id, error = %err, "failed to replace lost worker");
            }
        }
    }

    fn recreate(&self, slot: &mut Slot, reason: &str) -> Result<(), ExecutionError> {
        let generation = slot.generation + 1;
        let worker = SessionWorker::start(
            worker_label(self.id, generation),
            self.config.queue_capacity,
            self.config.worker_stack_bytes,
            Arc::clone(&self.factory),
        )?;
        let journal = slot.journal.clone();
        let me = self.me.clone();
        let session = self.id;
        worker.try_submit(
            Box::new(move |interp: &mut dyn Interpreter| {
                journal.replay(interp, session);
                if let Some(shared) = me.upgrade() {
                    shared.record(generation, None, interp.impure_predicates());
                }
            }),
            None,
        )?;
        lock(&self.cache).reset();
        let old = std::mem::replace(&mut slot.worker, worker);
        old.abandon();
        slot.generation = generation;
        warn!(
            session = %self.id,
            generation,
            reason,
            modules = slot.journal.modules.len(),
            "session worker replaced; asserted facts were dropped"
        );
        Ok(())
    }
}

/// A query in flight.
pub struct QueryHandle {
    state: HandleState,
}

enum HandleState {
    Ready(QueryResult),
    Pending {
        rx: Receiver<QueryResult>,
        submitted: Instant,
        wait_until: Instant,
        shared: Arc<SessionShared>,
        generation: u64,
    },
}

impl QueryHandle {
    const fn ready(result: QueryResult) -> Self {
        Self {
            state: HandleState::Ready(result),
        }
    }

    /// True when the result is already known (cache hits, syntax errors,
    /// rejected submissions).
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    /// Waits for the answer, at most until the query deadline plus the
    /// session's abort grace.
    #[must_use]
    pub fn join(self) -> QueryResult {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Pending {
                rx,
                submitted,
                wait_until,
                shared,
                generation,
            } => {
                let wait = wait_until.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(result) => result,
                    Err(RecvTimeoutError::Timeout) => {
                        shared.on_overdue(generation, "query did not stop at its deadline");
                        QueryResult::failed(QueryError::Timeout, submitted.elapsed())
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        shared.on_lost(generation);
                        QueryResult::failed(
                            QueryError::SessionLost("worker replaced before answering".to_string()),
                            submitted.elapsed(),
                        )
                    }
                }
            }
        }
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// One query as it travels to the worker.
#[derive(Clone)]
struct QueryJob {
    goal: Arc<Term>,
    var_names: Arc<[String]>,
    key: String,
    max_solutions: Option<usize>,
    max_inferences: Option<u64>,
    submitted: Instant,
    deadline: Instant,
    use_cache: bool,
    ticket: Option<WriteTicket>,
    cache_generation: u64,
    cache: Arc<Mutex<QueryCache>>,
}

impl QueryJob {
    fn run(self, interp: &mut dyn Interpreter, abort: Arc<AtomicBool>) -> QueryResult {
        if Instant::now() >= self.deadline {
            // Waited in the queue past its deadline.
            self.settle(&BTreeSet::new(), None);
            return QueryResult::failed(QueryError::Timeout, self.submitted.elapsed());
        }
        let deps = if self.use_cache {
            interp.dependencies(&self.goal)
        } else {
            None
        };
        let limits = QueryLimits {
            max_solutions: self.max_solutions,
            deadline: Some(self.deadline),
            abort: Some(abort),
            max_inferences: self.max_inferences,
        };
        match interp.solve(&self.goal, self.var_names.len(), &limits) {
            Ok(outcome) => {
                let solutions = outcome
                    .answers
                    .into_iter()
                    .map(|answer| Solution::from_answer(answer, &self.var_names))
                    .collect();
                let result = QueryResult::from_solutions(solutions, self.submitted.elapsed());
                let insert = deps
                    .filter(|_| outcome.mutated.is_empty())
                    .map(|deps| (deps, result.clone()));
                self.settle(&outcome.mutated, insert);
                result
            }
            Err(err) => {
                self.settle(&BTreeSet::new(), None);
                QueryResult::failed(err.into(), self.submitted.elapsed())
            }
        }
    }

    fn settle(&self, mutated: &BTreeSet<PredKey>, insert: Option<(BTreeSet<PredKey>, QueryResult)>) {
        let mut cache = lock(&self.cache);
        match self.ticket {
            Some(ticket) => cache.finish_write(ticket, mutated),
            None => cache.invalidate(mutated),
        }
        if let Some((deps, result)) = insert {
            cache.insert(self.key.clone(), result, deps, self.cache_generation);
        }
    }
}

/// An interpreter session with its own worker thread, module journal, and
/// query cache. Cloning shares the session.
#[derive(Clone)]
pub struct AdapterSession {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for AdapterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSession")
            .field("id", &self.shared.id)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl AdapterSession {
    /// Starts a session backed by the built-in resolver.
    pub fn new(config: SessionConfig) -> LogicResult<Self> {
        Self::with_factory(config, Arc::new(SldFactory))
    }

    /// Starts a session whose interpreter comes from `factory`.
    pub fn with_factory(config: SessionConfig, factory: Arc<dyn InterpreterFactory>) -> LogicResult<Self> {
        config.validate()?;
        let id = SessionId::new();
        let worker = SessionWorker::start(
            worker_label(id, 0),
            config.queue_capacity,
            config.worker_stack_bytes,
            Arc::clone(&factory),
        )?;
        let cache = Arc::new(Mutex::new(QueryCache::new(config.cache_capacity)));
        let shared = Arc::new_cyclic(|me| SessionShared {
            me: me.clone(),
            id,
            config,
            factory,
            slot: Mutex::new(Slot {
                worker,
                generation: 0,
                resets: 0,
                journal: Journal::default(),
                impure: Arc::default(),
            }),
            cache,
        });
        // Library predicates may already be impure; learn them before the first query.
        let impure = shared.run_job(|interp, _| interp.impure_predicates())?;
        lock(&shared.slot).impure = Arc::new(impure);
        info!(session = %id, "session started");
        Ok(Self { shared })
    }

    /// Identifier used in logs and error messages.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Incremented every time the interpreter is replaced.
    #[must_use]
    pub fn generation(&self) -> u64 {
        lock(&self.shared.slot).generation
    }

    /// Number of `reset` calls so far.
    #[must_use]
    pub fn resets(&self) -> u64 {
        lock(&self.shared.slot).resets
    }

    // ----- modules -----

    /// Parses `text` and consults it under `module_tag`.
    pub fn load_program(&self, text: &str, module_tag: &str) -> LogicResult<ConsultReport> {
        let program = Program::parse(text)?;
        self.load_compiled(Arc::new(program), module_tag)
    }

    /// Consults an already parsed program.
    pub fn load_compiled(&self, program: Arc<Program>, module_tag: &str) -> LogicResult<ConsultReport> {
        let tag = module_tag.to_string();
        let report = self.module_job(move |interp| {
            let report = interp.consult(&tag, &program)?;
            Ok((report, Some(JournalOp::Consult(tag, program))))
        })?;
        info!(session = %self.shared.id, module = module_tag, clauses = report.clauses, "module consulted");
        Ok(report)
    }

    /// Removes a module's clauses and consults `program` in their place, in
    /// one job.
    pub fn replace_module(&self, module_tag: &str, program: Arc<Program>) -> LogicResult<ConsultReport> {
        let tag = module_tag.to_string();
        let report = self.module_job(move |interp| {
            let report = interp.replace_module(&tag, &program)?;
            Ok((report, Some(JournalOp::Replace(tag, program))))
        })?;
        info!(session = %self.shared.id, module = module_tag, clauses = report.clauses, "module replaced");
        Ok(report)
    }

    /// Removes every clause consulted under `module_tag`.
    pub fn unload_module(&self, module_tag: &str) -> LogicResult<usize> {
        let tag = module_tag.to_string();
        let removed = self.module_job(move |interp| {
            let removed = interp.unload_module(&tag);
            Ok((removed, Some(JournalOp::Unload(tag))))
        })?;
        info!(session = %self.shared.id, module = module_tag, removed, "module unloaded");
        Ok(removed)
    }

    /// Marks a predicate dynamic; survives worker replacement.
    pub fn declare_dynamic(&self, key: PredKey) -> LogicResult<()> {
        self.module_job(move |interp| {
            interp.declare_dynamic(&key);
            Ok(((), Some(JournalOp::Dynamic(key))))
        })
    }

    fn module_job<R, F>(&self, job: F) -> LogicResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Interpreter) -> Result<(R, Option<JournalOp>), InterpreterError>
            + Clone
            + Send
            + 'static,
    {
        let shared = &self.shared;
        let ticket = lock(&shared.cache).begin_write(WriteScope::Global);
        let cache = Arc::clone(&shared.cache);
        let me = shared.me.clone();
        let session = shared.id.to_string();
        let submitted = shared.submit_job(move |interp, generation| {
            let outcome = job(interp).map_err(LogicError::from).and_then(|(value, op)| {
                let recorded = me
                    .upgrade()
                    .is_some_and(|s| s.record(generation, op, interp.impure_predicates()));
                if recorded {
                    Ok(value)
                } else {
                    Err(LogicError::from(ExecutionError::Disconnected { session }))
                }
            });
            lock(&cache).finish_write(ticket, &BTreeSet::new());
            outcome
        });
        let (rx, generation) = match submitted {
            Ok(queued) => queued,
            Err(err) => {
                lock(&shared.cache).finish_write(ticket, &BTreeSet::new());
                return Err(err.into());
            }
        };
        shared.await_job(&rx, generation)?
    }

    // ----- queries -----

    /// Submits a goal without waiting for it.
    ///
    /// Never fails: syntax errors, full queues, and lost workers come back as
    /// a ready handle carrying a failed `QueryResult`.
    pub fn submit_query(&self, goal: &str, opts: &QueryOptions) -> QueryHandle {
        let submitted = Instant::now();
        match parse_term(goal) {
            Ok(parsed) => self.submit_parsed(parsed, opts, submitted),
            Err(err) => QueryHandle::ready(QueryResult::failed(err.into(), submitted.elapsed())),
        }
    }

    pub(crate) fn submit_parsed(&self, parsed: ParsedTerm, opts: &QueryOptions, submitted: Instant) -> QueryHandle {
        let shared = &self.shared;
        let deadline = submitted + opts.timeout.unwrap_or_else(|| shared.config.default_timeout());
        let refs = goal_refs(&parsed.term);
        let impure = shared.impure();
        let writer = refs.mutating || refs.opaque || refs.preds.iter().any(|key| impure.contains(key));
        let use_cache = opts.use_cache && !writer && shared.config.cache_capacity > 0;
        let key = QueryCache::cache_key(&parsed.term.to_canonical_named(&parsed.var_names), opts.max_solutions);

        let (ticket, cache_generation) = {
            let mut cache = lock(&shared.cache);
            if use_cache {
                if let Some(mut hit) = cache.lookup(&key) {
                    debug!(session = %shared.id, goal = %key, "query cache hit");
                    hit.cached = true;
                    hit.time_ms = duration_ms(submitted.elapsed());
                    return QueryHandle::ready(hit);
                }
            }
            let ticket = writer.then(|| cache.begin_write(WriteScope::Global));
            (ticket, cache.generation())
        };

        let job = QueryJob {
            goal: Arc::new(parsed.term),
            var_names: Arc::from(parsed.var_names),
            key,
            max_solutions: opts.max_solutions,
            max_inferences: shared.config.max_inferences,
            submitted,
            deadline,
            use_cache,
            ticket,
            cache_generation,
            cache: Arc::clone(&shared.cache),
        };
        let (tx, rx) = bounded(1);
        let wait_until = deadline + shared.config.abort_grace();
        let dispatched = shared.dispatch(Some(wait_until), &mut |ctx: &Dispatch| {
            let job = job.clone();
            let tx = tx.clone();
            let abort = Arc::clone(&ctx.abort);
            let task: Task = Box::new(move |interp: &mut dyn Interpreter| {
                let _ = tx.send(job.run(interp, abort));
            });
            task
        });
        drop(tx);

        match dispatched {
            Ok(generation) => QueryHandle {
                state: HandleState::Pending {
                    rx,
                    submitted,
                    wait_until,
                    shared: Arc::clone(shared),
                    generation,
                },
            },
            Err(err) => {
                if let Some(ticket) = ticket {
                    lock(&shared.cache).finish_write(ticket, &BTreeSet::new());
                }
                warn!(session = %shared.id, error = %err, "query rejected");
                let error = match err {
                    ExecutionError::QueueFull { .. } => QueryError::Overloaded(err.to_string()),
                    other => QueryError::SessionLost(other.to_string()),
                };
                QueryHandle::ready(QueryResult::failed(error, submitted.elapsed()))
            }
        }
    }

    /// Runs a goal and waits for the result.
    #[must_use]
    pub fn query(&self, goal: &str, opts: &QueryOptions) -> QueryResult {
        self.submit_query(goal, opts).join()
    }

    /// First solution only.
    #[must_use]
    pub fn query_single(&self, goal: &str) -> QueryResult {
        self.query(goal, &QueryOptions::new().with_max_solutions(1))
    }

    /// Every solution.
    #[must_use]
    pub fn query_all(&self, goal: &str) -> QueryResult {
        self.query(goal, &QueryOptions::new())
    }

    /// True when `goal` has at least one solution. Errors count as failure.
    #[must_use]
    pub fn succeeds(&self, goal: &str) -> bool {
        let result = self.query_single(goal);
        if let Some(err) = &result.error {
            debug!(session = %self.shared.id, goal, error = %err, "succeeds/1 treated error as failure");
        }
        result.success
    }

    /// Collects every instance of `template` for which `goal` holds, as JSON.
    /// Unbound instances are dropped.
    pub fn find_all(&self, template: &str, goal: &str) -> LogicResult<Vec<Value>> {
        let text = format!("findall(({template}), ({goal}), {FIND_ALL_VAR})");
        let result = self
            .query(&text, &QueryOptions::new().with_max_solutions(1))
            .into_result()?;
        let Some(list) = result.first().and_then(|s| s.get(FIND_ALL_VAR)) else {
            return Ok(Vec::new());
        };
        let items = list
            .list_items()
            .ok_or_else(|| LogicError::internal("findall/3 did not produce a list"))?;
        Ok(items.into_iter().filter_map(term_to_json).collect())
    }

    /// `find_all` with each value deserialized into `T`.
    pub fn find_all_as<T: DeserializeOwned>(&self, template: &str, goal: &str) -> LogicResult<Vec<T>> {
        self.find_all(template, goal)?
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|err| {
                    LogicError::from(ValidationError::InvalidTerm {
                        reason: err.to_string(),
                    })
                })
            })
            .collect()
    }

    // ----- facts -----

    /// Adds a clause at the end of its predicate.
    pub fn assertz(&self, clause: &str) -> LogicResult<()> {
        let parsed = parse_term(clause)?;
        self.assertz_term(parsed.term)
    }

    /// [`assertz`](Self::assertz) for an already-built clause.
    pub fn assertz_term(&self, clause: Term) -> LogicResult<()> {
        let key = clause_key(&clause)?;
        self.transact(BTreeSet::from([key]), move |interp| {
            interp.assert_clause(&clause, true).map(|_| ())
        })
    }

    /// Removes every clause whose head unifies with `pattern`.
    pub fn retract_all(&self, pattern: &str) -> LogicResult<usize> {
        let parsed = parse_term(pattern)?;
        self.retract_all_term(parsed.term)
    }

    /// [`retract_all`](Self::retract_all) for an already-built head; returns the
    /// number of clauses removed.
    pub fn retract_all_term(&self, head: Term) -> LogicResult<usize> {
        let key = clause_key(&head)?;
        self.transact(BTreeSet::from([key]), move |interp| interp.retract_all(&head))
    }

    /// Stored facts unifying with `pattern`, in database order.
    pub fn matching_facts(&self, pattern: &str) -> LogicResult<Vec<Term>> {
        let head = parse_term(pattern)?.term;
        self.matching_facts_term(head)
    }

    /// [`matching_facts`](Self::matching_facts) for an already-built head.
    pub fn matching_facts_term(&self, head: Term) -> LogicResult<Vec<Term>> {
        Ok(self
            .shared
            .run_job(move |interp, _| interp.matching_facts(&head))??)
    }

    /// Runs `job` as one write touching `keys`. Cached results reading any of
    /// them are invalidated when the job is queued and again when it has run.
    pub(crate) fn transact<R, F>(&self, keys: BTreeSet<PredKey>, job: F) -> LogicResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Interpreter) -> Result<R, InterpreterError> + Clone + Send + 'static,
    {
        let shared = &self.shared;
        let ticket = lock(&shared.cache).begin_write(WriteScope::Keys(keys.clone()));
        let cache = Arc::clone(&shared.cache);
        let submitted = shared.submit_job(move |interp, _| {
            let result = job(interp);
            lock(&cache).finish_write(ticket, &keys);
            result
        });
        let (rx, generation) = match submitted {
            Ok(queued) => queued,
            Err(err) => {
                lock(&shared.cache).finish_write(ticket, &BTreeSet::new());
                return Err(err.into());
            }
        };
        Ok(shared.await_job(&rx, generation)??)
    }

    // ----- maintenance -----

    /// Replaces the interpreter with a fresh one and forgets every module
    /// and fact.
    pub fn reset(&self) -> LogicResult<()> {
        let mut slot = lock(&self.shared.slot);
        slot.journal = Journal::default();
        slot.resets += 1;
        self.shared.recreate(&mut slot, "reset")?;
        Ok(())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        lock(&self.shared.cache).stats()
    }

    pub fn clear_cache(&self) {
        lock(&self.shared.cache).clear();
    }

    /// Module tags currently in the journal, in consult order.
    #[must_use]
    pub fn loaded_modules(&self) -> Vec<String> {
        lock(&self.shared.slot)
            .journal
            .modules
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect()
    }
}

/// Predicate a clause or head pattern belongs to.
fn clause_key(clause: &Term) -> LogicResult<PredKey> {
    let head = match clause {
        Term::Compound(name, args) if name == ":-" && args.len() == 2 => &args[0],
        other => other,
    };
    head.pred_key().ok_or_else(|| {
        ValidationError::InvalidTerm {
            reason: format!("not a callable head: {}", head.to_canonical()),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    const THEORY: &str = "\
        interval(c, e, 4). interval(c, g, 7). interval(d, f, 3).\n\
        chord_tones(R, major, [R, T, F]) :- interval(R, T, 4), interval(R, F, 7).\n\
        :- dynamic(seen/1).\n";

    fn session() -> AdapterSession {
        let session = AdapterSession::new(SessionConfig::default()).unwrap();
        session.load_program(THEORY, "theory").unwrap();
        session
    }

    #[test]
    fn query_returns_named_bindings() {
        let s = session();
        let result = s.query_all("chord_tones(c, major, Notes)");
        assert!(result.success);
        assert_eq!(result.solutions.len(), 1);
        assert_eq!(result.solutions[0].get_json("Notes"), Some(json!(["c", "e", "g"])));
    }

    #[test]
    fn failure_is_not_an_error() {
        let s = session();
        let result = s.query_all("interval(x, _, _)");
        assert!(!result.success);
        assert!(result.error.is_none());
    }

    #[test]
    fn syntax_errors_are_reported_in_the_result() {
        let s = session();
        let handle = s.submit_query("interval(c, ", &QueryOptions::new());
        assert!(handle.is_ready());
        let result = handle.join();
        assert_eq!(result.error.as_ref().map(QueryError::kind), Some("syntax"));
    }

    #[test]
    fn repeated_queries_hit_the_cache() {
        let s = session();
        assert!(!s.query_all("interval(c, X, N)").cached);
        let second = s.query_all("interval(c,   X, N)");
        assert!(second.cached);
        assert_eq!(second.solutions.len(), 2);
        assert_eq!(s.cache_stats().hits, 1);
    }

    #[test]
    fn assertz_invalidates_dependent_entries_only() {
        let s = session();
        s.query_all("seen(X)");
        s.query_all("interval(c, X, N)");
        s.assertz("seen(a)").unwrap();
        let seen = s.query_all("seen(X)");
        assert!(!seen.cached);
        assert_eq!(seen.solutions.len(), 1);
        assert!(s.query_all("interval(c, X, N)").cached);
        assert_eq!(s.retract_all("seen(_)").unwrap(), 1);
        assert!(!s.query_all("seen(X)").success);
    }

    #[test]
    fn mutating_goals_are_never_cached() {
        let s = session();
        s.query_all("seen(X)");
        let first = s.query_all("assertz(seen(b)), seen(Y)");
        assert!(first.success);
        let again = s.query_all("assertz(seen(b)), seen(Y)");
        assert!(!again.cached);
        assert_eq!(s.query_all("seen(X)").solutions.len(), 2);
    }

    #[test]
    fn find_all_collects_json_values() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Step(String, i64);

        let s = session();
        let values = s.find_all("[T, N]", "interval(c, T, N)").unwrap();
        assert_eq!(values, vec![json!(["e", 4]), json!(["g", 7])]);
        let steps: Vec<Step> = s.find_all_as("[T, N]", "interval(c, T, N)").unwrap();
        assert_eq!(steps[1], Step("g".to_string(), 7));
        assert!(s.find_all("X", "interval(z, X, _)").unwrap().is_empty());
    }

    #[test]
    fn sessions_are_isolated() {
        let a = session();
        let b = session();
        a.assertz("seen(only_a)").unwrap();
        assert!(a.succeeds("seen(only_a)"));
        assert!(!b.succeeds("seen(only_a)"));
    }

    #[test]
    fn unload_and_replace_modules() {
        let s = session();
        assert!(s.succeeds("interval(d, f, 3)"));
        let replacement = Arc::new(Program::parse("interval(d, f, 4).").unwrap());
        s.replace_module("theory", replacement).unwrap();
        assert!(s.succeeds("interval(d, f, 4)"));
        assert!(!s.succeeds("interval(c, e, 4)"));
        assert_eq!(s.unload_module("theory").unwrap(), 1);
        let result = s.query_all("interval(d, f, N)");
        assert_eq!(result.error.as_ref().map(QueryError::kind), Some("existence"));
    }

    #[test]
    fn load_errors_are_returned() {
        let s = session();
        assert!(s.load_program("broken(", "bad").is_err());
        assert!(s.load_program("member(a, b).", "bad").is_err());
        assert!(s.loaded_modules().iter().all(|tag| tag != "bad"));
    }

    #[test]
    fn timeout_is_enforced_and_session_survives() {
        let s = session();
        s.load_program("spin :- spin.", "spin").unwrap();
        let started = Instant::now();
        let result = s.query(
            "spin",
            &QueryOptions::new().with_timeout(Duration::from_millis(50)),
        );
        assert!(result.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(s.succeeds("interval(c, e, 4)"));
    }

    #[test]
    fn reset_drops_everything() {
        let s = session();
        s.assertz("seen(x)").unwrap();
        let before = s.generation();
        let resets = s.resets();
        s.reset().unwrap();
        assert_eq!(s.generation(), before + 1);
        assert_eq!(s.resets(), resets + 1);
        assert!(s.loaded_modules().is_empty());
        let result = s.query_all("interval(c, e, 4)");
        assert_eq!(result.error.as_ref().map(QueryError::kind), Some("existence"));
    }

    #[test]
    fn max_solutions_limits_answers() {
        let s = session();
        let result = s.query("interval(c, X, _)", &QueryOptions::new().with_max_solutions(1));
        assert_eq!(result.solutions.len(), 1);
    }

    #[test]
    fn term_level_fact_operations() {
        let s = session();
        for note in ["c", "e"] {
            s.assertz_term(Term::compound("seen", vec![Term::atom(note)])).unwrap();
        }
        let pattern = Term::compound("seen", vec![Term::Var(0)]);
        let facts = s.matching_facts_term(pattern.clone()).unwrap();
        let text: Vec<String> = facts.iter().map(Term::to_canonical).collect();
        assert_eq!(text, vec!["seen(c)", "seen(e)"]);

        assert_eq!(s.retract_all_term(pattern.clone()).unwrap(), 2);
        assert!(s.matching_facts_term(pattern).unwrap().is_empty());
        assert!(s.assertz_term(Term::Int(3)).is_err());
    }
}
