//! Persistent module cache.
//!
//! Stores the compiled (parsed and serialized) form of a knowledge module
//! under its content address, so a later run can skip parsing. A version bump
//! changes the address and is simply a miss.
//!
//! The cache never fails its caller. Unavailable or full stores switch it to
//! no-cache mode with one warning, and any other store error counts as a
//! miss.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{KeyValueStore, StorageError};

/// What is stored under each key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub module_id: String,
    pub version_hash: String,
    pub compiled_text: String,
    pub stored_at: DateTime<Utc>,
}

/// Counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub enabled: bool,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

/// Advisory cache of compiled modules over a `KeyValueStore`.
pub struct ModuleCache {
    store: Option<Arc<dyn KeyValueStore>>,
    demoted: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl ModuleCache {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store: Some(store),
            demoted: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// A cache with no store: every `get` misses, every `put` is dropped.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            store: None,
            demoted: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some() && !self.demoted.load(Ordering::Relaxed)
    }

    /// Store key for a module version.
    #[must_use]
    pub fn key(module_id: &str, version_hash: &str) -> String {
        format!("kb:{module_id}:{version_hash}")
    }

    fn active_store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.store.as_ref().filter(|_| !self.demoted.load(Ordering::Relaxed))
    }

    /// Compiled text for `(module_id, version_hash)`, or `None` on a miss.
    pub fn get(&self, module_id: &str, version_hash: &str) -> Option<String> {
        let hit = self.lookup(module_id, version_hash);
        let counter = if hit.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    fn lookup(&self, module_id: &str, version_hash: &str) -> Option<String> {
        let store = self.active_store()?;
        let key = Self::key(module_id, version_hash);
        let bytes = match store.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.on_error(&err, module_id, "read");
                return None;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.module_id == module_id && entry.version_hash == version_hash => {
                debug!(module = module_id, version_hash, "module cache hit");
                Some(entry.compiled_text)
            }
            Ok(_) => {
                debug!(module = module_id, key = %key, "module cache entry belongs to another key");
                None
            }
            Err(err) => {
                debug!(module = module_id, error = %err, "unreadable module cache entry");
                None
            }
        }
    }

    /// Stores compiled text. Failures are logged and swallowed.
    pub fn put(&self, module_id: &str, version_hash: &str, compiled_text: &str) {
        let Some(store) = self.active_store() else {
            return;
        };
        let entry = CacheEntry {
            module_id: module_id.to_string(),
            version_hash: version_hash.to_string(),
            compiled_text: compiled_text.to_string(),
            stored_at: Utc::now(),
        };
        let result = serde_json::to_vec(&entry)
            .map_err(|e| StorageError::SerializationError(e.to_string()))
            .and_then(|bytes| store.put(&Self::key(module_id, version_hash), &bytes));
        match result {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                self.on_error(&err, module_id, "write");
            }
        }
    }

    fn on_error(&self, err: &StorageError, module_id: &str, action: &str) {
        if err.disables_cache() {
            if !self.demoted.swap(true, Ordering::Relaxed) {
                warn!(module = module_id, action, error = %err, "module cache unavailable; continuing without it");
            }
        } else {
            debug!(module = module_id, action, error = %err, "module cache error treated as miss");
        }
    }

    #[must_use]
    pub fn stats(&self) -> ModuleCacheStats {
        ModuleCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;

    struct FailingStore {
        error: StorageError,
    }

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(self.error.clone())
        }
        fn put(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Err(self.error.clone())
        }
        fn delete(&self, _key: &str) -> Result<bool, StorageError> {
            Err(self.error.clone())
        }
        fn keys(&self) -> Result<Vec<String>, StorageError> {
            Err(self.error.clone())
        }
    }

    #[test]
    fn put_then_get_by_version() {
        let cache = ModuleCache::new(Arc::new(InMemoryKvStore::new()));
        cache.put("theory-core", "v1hash", "compiled-v1");
        assert_eq!(cache.get("theory-core", "v1hash").as_deref(), Some("compiled-v1"));
        assert_eq!(cache.get("theory-core", "v2hash"), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));
    }

    #[test]
    fn unavailable_store_demotes_silently() {
        let cache = ModuleCache::new(Arc::new(FailingStore {
            error: StorageError::Unavailable("no storage".to_string()),
        }));
        cache.put("m", "h", "text");
        assert!(!cache.is_enabled());
        assert_eq!(cache.get("m", "h"), None);
        assert_eq!(cache.stats().write_failures, 1);
    }

    #[test]
    fn other_errors_count_as_misses() {
        let cache = ModuleCache::new(Arc::new(FailingStore {
            error: StorageError::BackendError("disk hiccup".to_string()),
        }));
        cache.put("m", "h", "text");
        assert_eq!(cache.get("m", "h"), None);
        assert!(cache.is_enabled());
    }

    #[test]
    fn quota_exceeded_demotes() {
        let cache = ModuleCache::new(Arc::new(InMemoryKvStore::with_quota(16)));
        cache.put("theory-core", "0123456789abcdef", "a long compiled program");
        assert!(!cache.is_enabled());
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = ModuleCache::disabled();
        cache.put("m", "h", "text");
        assert_eq!(cache.get("m", "h"), None);
        assert!(!cache.stats().enabled);
    }
}
