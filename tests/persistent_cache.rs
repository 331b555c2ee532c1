//! Module cache over the on-disk store, across simulated process runs.

#![cfg(feature = "persistent")]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use kyrologic::storage::persistent::DirectoryStore;
use kyrologic::{
    AdapterSession, KbManager, KnowledgeModule, LifecycleConfig, ModuleCache, ModuleRegistry, ModuleVersion,
    SessionConfig, Tier,
};

const HARMONY_V1: &str = "resolves(g, c). resolves(d, g).";
const HARMONY_V2: &str = "resolves(g, c). resolves(d, g). resolves(e, a).";

fn registry(version: ModuleVersion, source: &str) -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry
        .register(KnowledgeModule::new("harmony", version, Tier::Standard, source).unwrap())
        .unwrap();
    Arc::new(registry)
}

/// One "run": a fresh session and a fresh cache handle over `dir`.
fn run(dir: &Path, registry: &Arc<ModuleRegistry>) -> (KbManager, Arc<ModuleCache>) {
    let cache = Arc::new(ModuleCache::new(Arc::new(DirectoryStore::open(dir).unwrap())));
    let session = AdapterSession::new(SessionConfig::default()).unwrap();
    let manager = KbManager::new(session, Arc::clone(registry), Arc::clone(&cache), LifecycleConfig::default());
    (manager, cache)
}

fn entry_files(dir: &Path) -> Vec<std::path::PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("entry"))
        .collect()
}

#[test]
fn second_run_loads_from_disk() {
    let dir = tempdir().unwrap();
    let v1 = registry(ModuleVersion::new(1, 0, 0), HARMONY_V1);

    let (first, _) = run(dir.path(), &v1);
    assert!(!first.request_load("harmony").unwrap().from_cache);
    assert_eq!(entry_files(dir.path()).len(), 1);

    let (second, cache) = run(dir.path(), &v1);
    let outcome = second.request_load("harmony").unwrap();
    assert!(outcome.from_cache);
    assert_eq!(outcome.clauses, 2);
    assert_eq!(cache.stats().hits, 1);
    assert!(second.session().succeeds("resolves(d, g)"));
}

#[test]
fn version_bump_is_a_miss() {
    let dir = tempdir().unwrap();
    let (first, _) = run(dir.path(), &registry(ModuleVersion::new(1, 0, 0), HARMONY_V1));
    first.request_load("harmony").unwrap();

    let v2 = registry(ModuleVersion::new(1, 1, 0), HARMONY_V2);
    let (second, cache) = run(dir.path(), &v2);
    let outcome = second.request_load("harmony").unwrap();
    assert!(!outcome.from_cache);
    assert_eq!(cache.stats().misses, 1);
    assert!(second.session().succeeds("resolves(e, a)"));
    assert_eq!(entry_files(dir.path()).len(), 2);
}

#[test]
fn corrupted_entry_counts_as_miss_and_is_rewritten() {
    let dir = tempdir().unwrap();
    let v1 = registry(ModuleVersion::new(1, 0, 0), HARMONY_V1);
    run(dir.path(), &v1).0.request_load("harmony").unwrap();

    let path = entry_files(dir.path()).pop().unwrap();
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let (second, cache) = run(dir.path(), &v1);
    assert!(!second.request_load("harmony").unwrap().from_cache);
    assert!(cache.is_enabled(), "corruption does not demote the cache");

    let (third, _) = run(dir.path(), &v1);
    assert!(third.request_load("harmony").unwrap().from_cache);
}

#[test]
fn concurrent_runs_share_one_directory() {
    let dir = tempdir().unwrap();
    let v1 = registry(ModuleVersion::new(1, 0, 0), HARMONY_V1);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dir = dir.path().to_path_buf();
            let v1 = Arc::clone(&v1);
            std::thread::spawn(move || {
                let (manager, _) = run(&dir, &v1);
                manager.request_load("harmony").unwrap();
                manager.session().succeeds("resolves(g, c)")
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap());
    }
    assert_eq!(entry_files(dir.path()).len(), 1);
}
