//! Per-session module loading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::AdapterSession;
use crate::error::{LogicResult, ModuleError};
use crate::interpreter::Program;
use crate::module_cache::ModuleCache;

use super::{KnowledgeModule, LifecycleConfig, ModuleRegistry, ModuleState, ModuleVersion, Tier};

/// What a completed load did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub module: String,
    pub version: ModuleVersion,
    /// Compiled program came from the module cache.
    pub from_cache: bool,
    /// Version replaced by this load, if it was a migration.
    pub migrated_from: Option<ModuleVersion>,
    pub clauses: usize,
    #[serde(serialize_with = "serialize_ms")]
    pub duration: Duration,
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Result of [`KbManager::startup`].
#[derive(Debug, Clone)]
pub struct StartupReport {
    pub loaded: Vec<LoadOutcome>,
    pub failed: Vec<(String, ModuleError)>,
    pub total: Duration,
    pub budget: Duration,
    pub over_budget: bool,
}

impl StartupReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Load counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub loads: u64,
    pub migrations: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub unloads: u64,
    pub version_conflicts: u64,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    migrations: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    unloads: AtomicU64,
    version_conflicts: AtomicU64,
}

struct Entry {
    state: ModuleState,
    /// Bumped whenever a transition settles; waiters watch it.
    epoch: u64,
    outcome: Option<Result<LoadOutcome, ModuleError>>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: ModuleState::NotLoaded,
            epoch: 0,
            outcome: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Step {
    Done(Result<LoadOutcome, ModuleError>),
    Load { migrate_from: Option<ModuleVersion> },
}

/// Loads registered modules into one session.
///
/// Concurrent requests for the same module collapse into a single load and
/// every caller receives the same outcome.
pub struct KbManager {
    session: AdapterSession,
    registry: Arc<ModuleRegistry>,
    cache: Arc<ModuleCache>,
    config: LifecycleConfig,
    entries: Mutex<HashMap<String, Entry>>,
    /// Session reset count the entries were last reconciled against.
    seen_resets: AtomicU64,
    settled: Condvar,
    counters: Counters,
}

impl std::fmt::Debug for KbManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KbManager")
            .field("session", &self.session.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KbManager {
    #[must_use]
    pub fn new(
        session: AdapterSession,
        registry: Arc<ModuleRegistry>,
        cache: Arc<ModuleCache>,
        config: LifecycleConfig,
    ) -> Self {
        let seen_resets = AtomicU64::new(session.resets());
        Self {
            session,
            registry,
            cache,
            config,
            entries: Mutex::new(HashMap::new()),
            seen_resets,
            settled: Condvar::new(),
            counters: Counters::default(),
        }
    }

    /// Locks the entry table. After a session reset, modules the session no
    /// longer holds go back to `NotLoaded`.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = lock(&self.entries);
        let resets = self.session.resets();
        if self.seen_resets.swap(resets, Ordering::AcqRel) != resets {
            let resident = self.session.loaded_modules();
            let mut dropped = 0_usize;
            for (id, entry) in entries.iter_mut() {
                if entry.state.is_loaded() && !resident.contains(id) {
                    entry.state = ModuleState::NotLoaded;
                    entry.outcome = None;
                    entry.epoch += 1;
                    dropped += 1;
                }
            }
            debug!(session = %self.session.id(), dropped, "module states reconciled after session reset");
        }
        entries
    }

    #[must_use]
    pub fn session(&self) -> &AdapterSession {
        &self.session
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Loads every critical module. Never blocks on the budget: overruns are
    /// logged and reported.
    pub fn startup(&self) -> StartupReport {
        let started = Instant::now();
        let mut loaded = Vec::new();
        let mut failed = Vec::new();
        for id in self.registry.ids_in_tier(Tier::Critical) {
            match self.request_load(&id) {
                Ok(outcome) => loaded.push(outcome),
                Err(err) => {
                    warn!(session = %self.session.id(), module = %id, error = %err, "critical module failed to load");
                    failed.push((id, err));
                }
            }
        }
        let total = started.elapsed();
        let budget = Duration::from_millis(self.config.startup_budget_ms);
        let over_budget = total > budget;
        if over_budget {
            warn!(
                session = %self.session.id(),
                total_ms = total.as_millis(),
                budget_ms = self.config.startup_budget_ms,
                "critical modules exceeded the startup budget"
            );
        }
        info!(session = %self.session.id(), loaded = loaded.len(), failed = failed.len(), "startup complete");
        StartupReport {
            loaded,
            failed,
            total,
            budget,
            over_budget,
        }
    }

    /// Loads the latest version of `id` and its dependencies.
    pub fn request_load(&self, id: &str) -> Result<LoadOutcome, ModuleError> {
        let module = self.registry.latest(id)?;
        self.load_with_dependencies(&module)
    }

    /// Loads an exact version of `id`. If a higher version is already
    /// loaded it stays, and its outcome is returned.
    pub fn request_load_version(&self, id: &str, version: ModuleVersion) -> Result<LoadOutcome, ModuleError> {
        let module = self.registry.get(id, version)?;
        self.load_with_dependencies(&module)
    }

    /// Loads `id` unless some version of it is already resident.
    pub fn ensure_loaded(&self, id: &str) -> Result<(), ModuleError> {
        if self.state(id).is_loaded() {
            return Ok(());
        }
        self.request_load(id).map(|_| ())
    }

    fn load_with_dependencies(&self, module: &Arc<KnowledgeModule>) -> Result<LoadOutcome, ModuleError> {
        for dep in &module.dependencies {
            let order = self.registry.load_order(dep).map_err(|err| match err {
                cycle @ ModuleError::DependencyCycle { .. } => cycle,
                other => ModuleError::DependencyFailed {
                    module: module.id.clone(),
                    dependency: dep.clone(),
                    reason: other.to_string(),
                },
            })?;
            for needed in order {
                if needed.id == module.id {
                    return Err(ModuleError::DependencyCycle {
                        path: vec![module.id.clone(), dep.clone(), module.id.clone()],
                    });
                }
                self.load_one(&needed).map_err(|err| ModuleError::DependencyFailed {
                    module: module.id.clone(),
                    dependency: needed.id.clone(),
                    reason: err.to_string(),
                })?;
            }
        }
        self.load_one(module)
    }

    fn load_one(&self, module: &Arc<KnowledgeModule>) -> Result<LoadOutcome, ModuleError> {
        let migrate_from = match self.claim(module) {
            Step::Done(outcome) => return outcome,
            Step::Load { migrate_from } => migrate_from,
        };
        let started = Instant::now();
        let result = self.perform(module, migrate_from, started);

        let mut entries = self.entries();
        let entry = entries.entry(module.id.clone()).or_default();
        match &result {
            Ok(outcome) => {
                entry.state = ModuleState::Loaded(module.version);
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                if outcome.migrated_from.is_some() {
                    self.counters.migrations.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                // A rejected migration leaves the previous version resident.
                entry.state = migrate_from.map_or(ModuleState::NotLoaded, ModuleState::Loaded);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        entry.epoch += 1;
        entry.outcome = Some(result.clone());
        drop(entries);
        self.settled.notify_all();
        result
    }

    /// Decides under the lock whether this caller performs the load.
    fn claim(&self, module: &KnowledgeModule) -> Step {
        let mut entries = self.entries();
        loop {
            let entry = entries.entry(module.id.clone()).or_default();
            let state = entry.state;
            match state {
                ModuleState::Loading(_) | ModuleState::Unloading(_) => {
                    let was_loading = matches!(state, ModuleState::Loading(_));
                    let epoch = entry.epoch;
                    entries = self
                        .settled
                        .wait_while(entries, |map| map.get(&module.id).is_some_and(|e| e.epoch == epoch))
                        .unwrap_or_else(PoisonError::into_inner);
                    if was_loading {
                        let settled = entries.get(&module.id).and_then(|e| e.outcome.clone());
                        // Only share an outcome for the version this caller asked for.
                        if let Some(outcome) = settled.filter(|o| match o {
                            Ok(done) => done.version >= module.version,
                            Err(_) => true,
                        }) {
                            return Step::Done(outcome);
                        }
                    }
                }
                ModuleState::Loaded(loaded) if loaded >= module.version => {
                    if loaded > module.version {
                        self.counters.version_conflicts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            session = %self.session.id(),
                            module = %module.id,
                            loaded = %loaded,
                            requested = %module.version,
                            "version conflict; keeping the higher version"
                        );
                    }
                    if let Some(Ok(outcome)) = &entry.outcome {
                        return Step::Done(Ok(outcome.clone()));
                    }
                    return Step::Done(Ok(LoadOutcome {
                        module: module.id.clone(),
                        version: loaded,
                        from_cache: false,
                        migrated_from: None,
                        clauses: 0,
                        duration: Duration::ZERO,
                    }));
                }
                ModuleState::Loaded(loaded) => {
                    entry.state = ModuleState::Loading(module.version);
                    return Step::Load {
                        migrate_from: Some(loaded),
                    };
                }
                ModuleState::NotLoaded => {
                    entry.state = ModuleState::Loading(module.version);
                    return Step::Load { migrate_from: None };
                }
            }
        }
    }

    fn perform(
        &self,
        module: &KnowledgeModule,
        migrate_from: Option<ModuleVersion>,
        started: Instant,
    ) -> Result<LoadOutcome, ModuleError> {
        let failed = |reason: String| ModuleError::LoadFailed {
            module: module.id.clone(),
            version: module.version,
            session: self.session.id().to_string(),
            reason,
        };
        let (program, from_cache) = self
            .compiled(module)
            .map_err(|err| failed(err.to_string()))?;
        let program = Arc::new(program);
        let report = match migrate_from {
            Some(_) => self.session.replace_module(&module.id, program),
            None => self.session.load_compiled(program, &module.id),
        }
        .map_err(|err| failed(err.to_string()))?;

        let outcome = LoadOutcome {
            module: module.id.clone(),
            version: module.version,
            from_cache,
            migrated_from: migrate_from,
            clauses: report.clauses,
            duration: started.elapsed(),
        };
        match migrate_from {
            Some(from) => info!(
                session = %self.session.id(),
                module = %module.id,
                from = %from,
                to = %module.version,
                "module migrated"
            ),
            None => info!(
                session = %self.session.id(),
                module = %module.id,
                version = %module.version,
                from_cache,
                duration_ms = outcome.duration.as_millis(),
                "module loaded"
            ),
        }
        Ok(outcome)
    }

    /// Parsed program for `module`, from the cache when possible.
    fn compiled(&self, module: &KnowledgeModule) -> LogicResult<(Program, bool)> {
        let hash = module.version_hash();
        if let Some(text) = self.cache.get(&module.id, &hash) {
            match Program::from_compiled_text(&text) {
                Ok(program) => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((program, true));
                }
                Err(err) => debug!(module = %module.id, error = %err, "cached program unreadable; reparsing"),
            }
        }
        let program = Program::parse(&module.source)?;
        match program.to_compiled_text() {
            Ok(text) => self.cache.put(&module.id, &hash, &text),
            Err(err) => debug!(module = %module.id, error = %err, "program not cacheable"),
        }
        Ok((program, false))
    }

    /// Unloads an optional module. Returns `false` if it was not loaded.
    pub fn unload(&self, id: &str) -> LogicResult<bool> {
        let module = self.registry.latest(id)?;
        if !module.tier.is_unloadable() {
            return Err(ModuleError::NotUnloadable {
                module: id.to_string(),
                tier: module.tier,
            }
            .into());
        }

        let version = {
            let mut entries = self.entries();
            let ModuleState::Loaded(version) = entries.get(id).map_or(ModuleState::NotLoaded, |e| e.state) else {
                return Ok(false);
            };
            if let Some(dependent) = self.loaded_dependent(&entries, id) {
                return Err(ModuleError::InUse {
                    module: id.to_string(),
                    dependent,
                }
                .into());
            }
            if let Some(entry) = entries.get_mut(id) {
                entry.state = ModuleState::Unloading(version);
            }
            version
        };

        let result = self.session.unload_module(id);

        let mut entries = self.entries();
        let entry = entries.entry(id.to_string()).or_default();
        entry.epoch += 1;
        let outcome = match result {
            Ok(removed) => {
                entry.state = ModuleState::NotLoaded;
                entry.outcome = None;
                self.counters.unloads.fetch_add(1, Ordering::Relaxed);
                info!(session = %self.session.id(), module = id, version = %version, removed, "module unloaded");
                Ok(true)
            }
            Err(err) => {
                entry.state = ModuleState::Loaded(version);
                Err(err)
            }
        };
        drop(entries);
        self.settled.notify_all();
        outcome
    }

    fn loaded_dependent(&self, entries: &HashMap<String, Entry>, id: &str) -> Option<String> {
        let mut dependents: Vec<&String> = entries
            .iter()
            .filter_map(|(other, entry)| match entry.state {
                ModuleState::Loaded(v) | ModuleState::Loading(v) if other != id => self
                    .registry
                    .get(other, v)
                    .ok()
                    .filter(|m| m.dependencies.iter().any(|d| d == id))
                    .map(|_| other),
                _ => None,
            })
            .collect();
        dependents.sort();
        dependents.first().map(|s| (*s).clone())
    }

    /// Unloads every optional module nothing else depends on, repeating
    /// until no more can go. Returns the unloaded ids in order.
    pub fn relieve_memory_pressure(&self) -> Vec<String> {
        let mut unloaded = Vec::new();
        loop {
            let mut candidates: Vec<String> = self.entries()
                .iter()
                .filter(|(_, e)| e.state.is_loaded())
                .map(|(id, _)| id.clone())
                .filter(|id| self.registry.latest(id).is_ok_and(|m| m.tier.is_unloadable()))
                .collect();
            candidates.sort();
            let before = unloaded.len();
            for id in candidates {
                match self.unload(&id) {
                    Ok(true) => unloaded.push(id),
                    Ok(false) => {}
                    Err(err) => debug!(module = %id, error = %err, "kept under memory pressure"),
                }
            }
            if unloaded.len() == before {
                break;
            }
        }
        if !unloaded.is_empty() {
            info!(session = %self.session.id(), count = unloaded.len(), "optional modules released");
        }
        unloaded
    }

    #[must_use]
    pub fn state(&self, id: &str) -> ModuleState {
        self.entries()
            .get(id)
            .map_or(ModuleState::NotLoaded, |e| e.state)
    }

    /// Resident modules and their versions, sorted by id.
    #[must_use]
    pub fn loaded_modules(&self) -> Vec<(String, ModuleVersion)> {
        let mut loaded: Vec<(String, ModuleVersion)> = self.entries()
            .iter()
            .filter_map(|(id, e)| match e.state {
                ModuleState::Loaded(v) => Some((id.clone(), v)),
                _ => None,
            })
            .collect();
        loaded.sort();
        loaded
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let c = &self.counters;
        ManagerStats {
            loads: c.loads.load(Ordering::Relaxed),
            migrations: c.migrations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            unloads: c.unloads.load(Ordering::Relaxed),
            version_conflicts: c.version_conflicts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::engine::SessionConfig;
    use crate::storage::InMemoryKvStore;

    fn module(id: &str, version: &str, tier: Tier, source: &str, deps: &[&str]) -> KnowledgeModule {
        KnowledgeModule::new(id, version.parse().unwrap(), tier, source)
            .unwrap()
            .with_dependencies(deps.iter().copied())
            .unwrap()
    }

    fn manager(modules: Vec<KnowledgeModule>) -> KbManager {
        let mut registry = ModuleRegistry::new();
        for m in modules {
            registry.register(m).unwrap();
        }
        let session = AdapterSession::new(SessionConfig::default()).unwrap();
        KbManager::new(
            session,
            Arc::new(registry),
            Arc::new(ModuleCache::new(Arc::new(InMemoryKvStore::new()))),
            LifecycleConfig::default(),
        )
    }

    #[test]
    fn concurrent_requests_load_once() {
        let mgr = Arc::new(manager(vec![module(
            "theory-core",
            "1.0.0",
            Tier::Critical,
            "interval(c, e, 4). interval(c, g, 7).",
            &[],
        )]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || mgr.request_load("theory-core").unwrap())
            })
            .collect();
        let outcomes: Vec<LoadOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(mgr.stats().loads, 1);
        assert_eq!(mgr.session().loaded_modules(), vec!["theory-core".to_string()]);
        let result = mgr.session().query_all("interval(c, X, _)");
        assert_eq!(result.solutions.len(), 2);
    }

    #[test]
    fn dependencies_load_first() {
        let mgr = manager(vec![
            module("base", "1.0.0", Tier::Standard, "note(c). note(e).", &[]),
            module("chords", "1.0.0", Tier::Standard, "has(X) :- note(X).", &["base"]),
        ]);
        mgr.ensure_loaded("chords").unwrap();
        assert_eq!(mgr.session().loaded_modules(), vec!["base", "chords"]);
        assert!(mgr.state("base").is_loaded());
        assert!(mgr.session().succeeds("has(e)"));
    }

    #[test]
    fn session_reset_forgets_loaded_modules() {
        let mgr = manager(vec![module("base", "1.0.0", Tier::Standard, "note(c).", &[])]);
        mgr.ensure_loaded("base").unwrap();
        assert!(mgr.session().succeeds("note(c)"));

        mgr.session().reset().unwrap();
        assert_eq!(mgr.state("base"), ModuleState::NotLoaded);
        assert!(mgr.loaded_modules().is_empty());

        mgr.ensure_loaded("base").unwrap();
        assert_eq!(mgr.session().loaded_modules(), vec!["base"]);
        let result = mgr.session().query_single("note(c)");
        assert!(result.success, "{:?}", result.error);
        assert_eq!(mgr.stats().loads, 2);
    }

    #[test]
    fn failed_load_resets_and_retries() {
        let mgr = manager(vec![module("broken", "1.0.0", Tier::Standard, "p(.", &[])]);
        let err = mgr.request_load("broken").unwrap_err();
        assert!(matches!(err, ModuleError::LoadFailed { .. }));
        assert_eq!(mgr.state("broken"), ModuleState::NotLoaded);
        assert!(mgr.request_load("broken").is_err());
        assert_eq!(mgr.stats().failures, 2);
    }

    #[test]
    fn newer_version_migrates_in_place() {
        let mgr = manager(vec![
            module("scales", "1.0.0", Tier::Standard, "scale(major). scale(minor).", &[]),
            module("scales", "1.1.0", Tier::Standard, "scale(major). scale(dorian).", &[]),
        ]);
        mgr.request_load_version("scales", ModuleVersion::new(1, 0, 0)).unwrap();
        assert!(mgr.session().succeeds("scale(minor)"));
        let outcome = mgr.request_load("scales").unwrap();
        assert_eq!(outcome.migrated_from, Some(ModuleVersion::new(1, 0, 0)));
        assert!(!mgr.session().succeeds("scale(minor)"));
        assert!(mgr.session().succeeds("scale(dorian)"));
        assert_eq!(mgr.session().query_all("scale(X)").solutions.len(), 2);

        // Asking for the older version again keeps the newer one.
        let kept = mgr.request_load_version("scales", ModuleVersion::new(1, 0, 0)).unwrap();
        assert_eq!(kept.version, ModuleVersion::new(1, 1, 0));
        assert_eq!(mgr.stats().version_conflicts, 1);
    }

    #[test]
    fn only_optional_modules_unload() {
        let mgr = manager(vec![
            module("core", "1.0.0", Tier::Critical, "c(1).", &[]),
            module("extra", "1.0.0", Tier::Optional, "x(1).", &[]),
            module("addon", "1.0.0", Tier::Optional, "y(Z) :- x(Z).", &["extra"]),
        ]);
        let report = mgr.startup();
        assert!(report.is_complete());
        assert_eq!(report.loaded.len(), 1);
        assert!(matches!(
            mgr.unload("core").unwrap_err(),
            crate::error::LogicError::Module(ModuleError::NotUnloadable { .. })
        ));

        mgr.request_load("addon").unwrap();
        assert!(matches!(
            mgr.unload("extra").unwrap_err(),
            crate::error::LogicError::Module(ModuleError::InUse { .. })
        ));

        let released = mgr.relieve_memory_pressure();
        assert_eq!(released, vec!["addon".to_string(), "extra".to_string()]);
        assert_eq!(mgr.loaded_modules(), vec![("core".to_string(), ModuleVersion::new(1, 0, 0))]);
        assert!(!mgr.unload("extra").unwrap());
    }

    #[test]
    fn cache_hit_skips_parsing_for_second_session() {
        let store = Arc::new(InMemoryKvStore::new());
        let cache = Arc::new(ModuleCache::new(store));
        let mut registry = ModuleRegistry::new();
        registry
            .register(module("theory-core", "1.0.0", Tier::Critical, "triad(c, [c, e, g]).", &[]))
            .unwrap();
        let registry = Arc::new(registry);

        let first = KbManager::new(
            AdapterSession::new(SessionConfig::default()).unwrap(),
            Arc::clone(&registry),
            Arc::clone(&cache),
            LifecycleConfig::default(),
        );
        assert!(!first.request_load("theory-core").unwrap().from_cache);

        let second = KbManager::new(
            AdapterSession::new(SessionConfig::default()).unwrap(),
            registry,
            cache,
            LifecycleConfig::default(),
        );
        assert!(second.request_load("theory-core").unwrap().from_cache);
        assert!(second.session().succeeds("triad(c, [c, e, g])"));
    }

    #[test]
    fn dependency_failure_names_the_dependency() {
        let mgr = manager(vec![
            module("bad", "1.0.0", Tier::Standard, "oops(", &[]),
            module("user", "1.0.0", Tier::Standard, "u.", &["bad"]),
        ]);
        match mgr.request_load("user") {
            Err(ModuleError::DependencyFailed { dependency, .. }) => assert_eq!(dependency, "bad"),
            other => panic!("expected dependency failure, got {other:?}"),
        }
        assert_eq!(mgr.state("user"), ModuleState::NotLoaded);
    }
}
