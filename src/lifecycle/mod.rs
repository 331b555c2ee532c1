//! Knowledge-module lifecycle.
//!
//! Modules are registered once in a [`ModuleRegistry`] and loaded into a
//! session by a [`KbManager`]. Each (session, module) pair moves through
//! [`ModuleState`]:
//!
//! ```text
//! NotLoaded -> Loading -> Loaded -> [Unloading -> NotLoaded]
//! ```
//!
//! Critical modules load at startup and stay. Standard modules load on first
//! use and stay. Optional modules load lazily and may be unloaded again.

mod manager;
mod registry;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;
use crate::ident;

pub use manager::{KbManager, LoadOutcome, ManagerStats, StartupReport};
pub use registry::ModuleRegistry;

/// Loading priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Loaded by `startup()`; never unloaded.
    Critical,
    /// Loaded on first use; stays resident.
    Standard,
    /// Loaded on demand; may be unloaded under memory pressure.
    Optional,
}

impl Tier {
    #[must_use]
    pub const fn is_unloadable(self) -> bool {
        matches!(self, Self::Optional)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::Optional => "optional",
        })
    }
}

/// Semantic version `MAJOR.MINOR.PATCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModuleVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ModuleVersion {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidVersion { value: s.to_string() };
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ValidationError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl Serialize for ModuleVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModuleVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A named, versioned bundle of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeModule {
    pub id: String,
    pub version: ModuleVersion,
    pub tier: Tier,
    pub source: Arc<str>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl KnowledgeModule {
    /// Creates a module, validating its id.
    pub fn new(
        id: impl Into<String>,
        version: ModuleVersion,
        tier: Tier,
        source: impl Into<Arc<str>>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        ident::validate(ident::MODULE_ID, &id, "module id")?;
        Ok(Self {
            id,
            version,
            tier,
            source: source.into(),
            dependencies: Vec::new(),
        })
    }

    /// Adds modules that must be loaded before this one.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            ident::validate(ident::MODULE_ID, &dep, "module id")?;
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        Ok(self)
    }

    /// Content address: BLAKE3 over id, version, and source.
    #[must_use]
    pub fn version_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.version.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.source.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Per-session state of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum ModuleState {
    NotLoaded,
    Loading(ModuleVersion),
    Loaded(ModuleVersion),
    Unloading(ModuleVersion),
}

impl ModuleState {
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::NotLoaded | Self::Loaded(_))
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Soft budget for loading every critical module at startup.
    pub startup_budget_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { startup_budget_ms: 250 }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.startup_budget_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "lifecycle.startup_budget_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_and_order() {
        let v: ModuleVersion = "1.10.0".parse().unwrap();
        assert_eq!(v, ModuleVersion::new(1, 10, 0));
        assert!(v > "1.9.7".parse().unwrap());
        assert!("1.0".parse::<ModuleVersion>().is_err());
        assert!("1.0.0.1".parse::<ModuleVersion>().is_err());
        assert!("1.-1.0".parse::<ModuleVersion>().is_err());
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"1.10.0\"");
    }

    #[test]
    fn version_hash_tracks_content() {
        let a = KnowledgeModule::new("theory-core", ModuleVersion::new(1, 0, 0), Tier::Critical, "p(1).").unwrap();
        let mut b = a.clone();
        assert_eq!(a.version_hash(), b.version_hash());
        b.version = ModuleVersion::new(1, 0, 1);
        assert_ne!(a.version_hash(), b.version_hash());
        let c = KnowledgeModule::new("theory-core", ModuleVersion::new(1, 0, 0), Tier::Critical, "p(2).").unwrap();
        assert_ne!(a.version_hash(), c.version_hash());
    }

    #[test]
    fn module_ids_are_validated() {
        assert!(KnowledgeModule::new("Bad Id", ModuleVersion::new(1, 0, 0), Tier::Standard, "").is_err());
        let m = KnowledgeModule::new("voicing", ModuleVersion::new(1, 0, 0), Tier::Optional, "")
            .unwrap()
            .with_dependencies(["theory-core", "theory-core"])
            .unwrap();
        assert_eq!(m.dependencies, vec!["theory-core".to_string()]);
        assert!(Tier::Optional.is_unloadable());
        assert_eq!(Tier::Critical.to_string(), "critical");
    }

    #[test]
    fn module_manifest_round_trips_through_json() {
        let m = KnowledgeModule::new("voicing", ModuleVersion::new(2, 1, 0), Tier::Optional, "drop2(c).")
            .unwrap()
            .with_dependencies(["theory-core"])
            .unwrap();
        let text = serde_json::to_string(&m).unwrap();
        let back: KnowledgeModule = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
        assert_eq!(&*back.source, "drop2(c).");

        let manifest = r#"{"id":"scales","version":"1.0.0","tier":"standard","source":"scale(major)."}"#;
        let parsed: KnowledgeModule = serde_json::from_str(manifest).unwrap();
        assert!(parsed.dependencies.is_empty());
        let built =
            KnowledgeModule::new("scales", ModuleVersion::new(1, 0, 0), Tier::Standard, "scale(major).").unwrap();
        assert_eq!(parsed.version_hash(), built.version_hash());
    }
}
