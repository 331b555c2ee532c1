//! Runtime configuration.
//!
//! ```toml
//! [session]
//! default_timeout_ms = 500
//!
//! [lifecycle]
//! startup_budget_ms = 200
//!
//! [profiler]
//! window = 1000
//!
//! [cache]
//! dir = "/var/cache/kyrologic"
//!
//! [[budgets]]
//! pathLabel = "chords.suggest"
//! p95BudgetMs = 20.0
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::SessionConfig;
use crate::error::{LogicError, LogicResult, ValidationError};
use crate::lifecycle::LifecycleConfig;
use crate::module_cache::ModuleCache;
use crate::profile::{PerfBudget, ProfilerConfig};

/// Where compiled modules are cached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for the on-disk store. `None` runs without a cache.
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Opens the configured cache. A directory that cannot be opened, or a
    /// build without the `persistent` feature, yields a disabled cache.
    #[must_use]
    pub fn open(&self) -> Arc<ModuleCache> {
        let Some(dir) = &self.dir else {
            return Arc::new(ModuleCache::disabled());
        };
        Arc::new(open_dir(dir))
    }
}

#[cfg(feature = "persistent")]
fn open_dir(dir: &Path) -> ModuleCache {
    match crate::storage::persistent::DirectoryStore::open(dir) {
        Ok(store) => ModuleCache::new(Arc::new(store)),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "module cache unavailable; running without it");
            ModuleCache::disabled()
        }
    }
}

#[cfg(not(feature = "persistent"))]
fn open_dir(dir: &Path) -> ModuleCache {
    warn!(dir = %dir.display(), "built without the persistent feature; module cache disabled");
    ModuleCache::disabled()
}

/// Everything a host needs to stand the runtime up.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub lifecycle: LifecycleConfig,
    pub profiler: ProfilerConfig,
    pub cache: CacheConfig,
    pub budgets: Vec<PerfBudget>,
}

impl RuntimeConfig {
    /// Parses and validates TOML. Missing sections take their defaults.
    pub fn from_toml_str(text: &str) -> LogicResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("config TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file.
    pub fn load(path: &Path) -> LogicResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LogicError::from(ValidationError::InvalidConfig {
                reason: format!("cannot read {}: {e}", path.display()),
            })
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.session.validate()?;
        self.lifecycle.validate()?;
        self.profiler.validate()?;
        let mut seen = std::collections::HashSet::new();
        for budget in &self.budgets {
            budget.validate()?;
            if !seen.insert(budget.path_label.as_str()) {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("duplicate budget for '{}'", budget.path_label),
                });
            }
        }
        Ok(())
    }
}
