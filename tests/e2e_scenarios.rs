//! End-to-end scenarios across the adapter, lifecycle, cache, and bridges.

use std::sync::Arc;
use std::thread;

use serde_json::json;

use kyrologic::storage::{KeyValueStore, StorageError};
use kyrologic::{
    ActionType, AdapterSession, ConstraintRegistry, IntentBridge, IntentSpec, KbManager, KnowledgeModule,
    LifecycleConfig, ModuleCache, ModuleRegistry, ModuleVersion, SessionConfig, Tier,
};

const THEORY_CORE: &str = r"
note(c, 0). note(cs, 1). note(d, 2). note(ds, 3). note(e, 4). note(f, 5).
note(fs, 6). note(g, 7). note(gs, 8). note(a, 9). note(as, 10). note(b, 11).

quality(major, [0, 4, 7]).
quality(minor, [0, 3, 7]).

chord_tones(Root, Quality, Tones) :-
    note(Root, I),
    quality(Quality, Steps),
    findall(N, (member(S, Steps), P is (I + S) mod 12, note(N, P)), Tones).
";

fn registry() -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry
        .register(KnowledgeModule::new("theory-core", ModuleVersion::new(1, 0, 0), Tier::Critical, THEORY_CORE).unwrap())
        .unwrap();
    Arc::new(registry)
}

fn manager_with(cache: Arc<ModuleCache>) -> KbManager {
    let session = AdapterSession::new(SessionConfig::default()).unwrap();
    KbManager::new(session, registry(), cache, LifecycleConfig::default())
}

#[test]
fn theory_core_requested_twice_loads_once() {
    let manager = Arc::new(manager_with(Arc::new(ModuleCache::disabled())));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let m = Arc::clone(&manager);
            thread::spawn(move || m.request_load("theory-core").unwrap())
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let again = manager.request_load("theory-core").unwrap();

    assert!(outcomes.iter().all(|o| *o == again));
    assert_eq!(manager.stats().loads, 1);
    assert_eq!(manager.session().loaded_modules(), vec!["theory-core".to_string()]);
}

#[test]
fn chord_tones_of_c_major() {
    let manager = manager_with(Arc::new(ModuleCache::disabled()));
    let report = manager.startup();
    assert!(report.is_complete());

    let result = manager.session().query_single("chord_tones(c, major, X)");
    assert!(result.success);
    assert_eq!(result.first().unwrap().get_json("X"), Some(json!(["c", "e", "g"])));

    let minor = manager.session().query_single("chord_tones(a, minor, X)");
    assert_eq!(minor.first().unwrap().get_json("X"), Some(json!(["a", "c", "e"])));
}

#[test]
fn pushed_spec_key_is_visible_until_pop() {
    let session = AdapterSession::new(SessionConfig::default()).unwrap();
    let bridge = IntentBridge::new(session.clone(), Arc::new(ConstraintRegistry::new())).unwrap();

    bridge.push(&IntentSpec::new().with_key("d", "dorian")).unwrap();
    assert!(session.succeeds("spec_key(current, d, dorian)"));
    bridge.pop().unwrap();
    assert!(!session.succeeds("spec_key(current, _, _)"));
    assert!(bridge.pop().is_err());
}

#[test]
fn pushed_c_major_binds_root_and_mode() {
    let session = AdapterSession::new(SessionConfig::default()).unwrap();
    let bridge = IntentBridge::new(session.clone(), Arc::new(ConstraintRegistry::new())).unwrap();

    bridge.push(&IntentSpec::new().with_key("c", "major")).unwrap();
    let result = session.query_single("spec_key(current,R,M)");
    assert!(result.success);
    let answer = result.first().unwrap();
    assert_eq!(answer.get_json("R"), Some(json!("c")));
    assert_eq!(answer.get_json("M"), Some(json!("major")));

    bridge.pop().unwrap();
    let after = session.query_single("spec_key(current,R,M)");
    assert!(!after.success);
    assert!(after.solutions.is_empty());
}

#[test]
fn ground_action_goal_decodes_as_written() {
    let session = AdapterSession::new(SessionConfig::default()).unwrap();

    let proposals = session.query_host_actions("action(set_tempo(120), 0.9, [because(genre_house)]).");
    assert_eq!(proposals.len(), 1);
    let p = &proposals[0];
    assert_eq!(p.action_type, ActionType::SetTempo);
    assert_eq!(p.payload, json!({"bpm": 120}));
    assert!((p.confidence.value() - 0.9).abs() < f64::EPSILON);
    assert_eq!(p.reasons, vec!["genre_house".to_string()]);
}

#[test]
fn set_tempo_becomes_a_proposal() {
    let session = AdapterSession::new(SessionConfig::default()).unwrap();
    session
        .load_program(
            "suggest_tempo(action(set_tempo(120), 0.9, [because('tempo fits genre')])) :- genre(house).\n\
             genre(house).",
            "advice",
        )
        .unwrap();

    let proposals = session.query_host_actions("suggest_tempo(A)");
    assert_eq!(proposals.len(), 1);
    let p = &proposals[0];
    assert_eq!(p.action_type, ActionType::SetTempo);
    assert_eq!(p.payload, json!({"bpm": 120}));
    assert!((p.confidence.value() - 0.9).abs() < f64::EPSILON);
    assert_eq!(p.reasons, vec!["tempo fits genre".to_string()]);

    let wire = serde_json::to_value(p).unwrap();
    assert_eq!(wire["type"], json!("set_tempo"));
}

struct BrokenStore;

impl KeyValueStore for BrokenStore {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Err(StorageError::Unavailable("storage disabled by host".to_string()))
    }

    fn put(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("storage disabled by host".to_string()))
    }

    fn delete(&self, _key: &str) -> Result<bool, StorageError> {
        Err(StorageError::Unavailable("storage disabled by host".to_string()))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Unavailable("storage disabled by host".to_string()))
    }
}

#[test]
fn failing_cache_store_degrades_to_no_cache() {
    let cache = Arc::new(ModuleCache::new(Arc::new(BrokenStore)));
    let manager = manager_with(Arc::clone(&cache));

    let outcome = manager.request_load("theory-core").unwrap();
    assert!(!outcome.from_cache);
    assert!(!cache.is_enabled());
    assert!(!cache.stats().enabled);
    assert!(manager.session().succeeds("chord_tones(g, major, [g, b, d])"));

    // A second session sharing the demoted cache still loads from source.
    let other = manager_with(cache);
    assert!(!other.request_load("theory-core").unwrap().from_cache);
}
