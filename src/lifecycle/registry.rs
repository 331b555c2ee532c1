//! Module registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::error::ModuleError;

use super::{KnowledgeModule, ModuleVersion, Tier};

/// Every known module, possibly in several versions.
#[derive(Debug, Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, BTreeMap<ModuleVersion, Arc<KnowledgeModule>>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module version. Registering the same content twice is a no-op;
    /// the same version with different content is rejected.
    pub fn register(&mut self, module: KnowledgeModule) -> Result<Arc<KnowledgeModule>, ModuleError> {
        let versions = self.modules.entry(module.id.clone()).or_default();
        if let Some(existing) = versions.get(&module.version) {
            if existing.as_ref() == &module {
                return Ok(Arc::clone(existing));
            }
            return Err(ModuleError::VersionConflict {
                module: module.id,
                version: module.version,
            });
        }
        debug!(module = %module.id, version = %module.version, tier = %module.tier, "module registered");
        let module = Arc::new(module);
        versions.insert(module.version, Arc::clone(&module));
        Ok(module)
    }

    /// Highest registered version of `id`.
    pub fn latest(&self, id: &str) -> Result<Arc<KnowledgeModule>, ModuleError> {
        self.modules
            .get(id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| ModuleError::NotRegistered { module: id.to_string() })
    }

    /// An exact version of `id`.
    pub fn get(&self, id: &str, version: ModuleVersion) -> Result<Arc<KnowledgeModule>, ModuleError> {
        let versions = self
            .modules
            .get(id)
            .ok_or_else(|| ModuleError::NotRegistered { module: id.to_string() })?;
        versions
            .get(&version)
            .cloned()
            .ok_or_else(|| ModuleError::VersionNotRegistered {
                module: id.to_string(),
                version,
            })
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// Ids of every module whose latest version has `tier`, sorted.
    #[must_use]
    pub fn ids_in_tier(&self, tier: Tier) -> Vec<String> {
        let mut ids: Vec<String> = self
            .modules
            .iter()
            .filter(|(_, versions)| versions.values().next_back().is_some_and(|m| m.tier == tier))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Transitive dependencies of `id` (latest versions), dependencies first
    /// and `id` last.
    pub fn load_order(&self, id: &str) -> Result<Vec<Arc<KnowledgeModule>>, ModuleError> {
        let mut order = Vec::new();
        let mut path = Vec::new();
        self.visit(id, &mut path, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        id: &str,
        path: &mut Vec<String>,
        order: &mut Vec<Arc<KnowledgeModule>>,
    ) -> Result<(), ModuleError> {
        if order.iter().any(|m| m.id == id) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|p| p == id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(id.to_string());
            return Err(ModuleError::DependencyCycle { path: cycle });
        }
        let module = self.latest(id)?;
        path.push(id.to_string());
        for dep in &module.dependencies {
            self.visit(dep, path, order)?;
        }
        path.pop();
        order.push(module);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: &str, version: &str, deps: &[&str]) -> KnowledgeModule {
        KnowledgeModule::new(id, version.parse().unwrap(), Tier::Standard, format!("{}_v(1).", id.replace('-', "_")))
            .unwrap()
            .with_dependencies(deps.iter().copied())
            .unwrap()
    }

    #[test]
    fn latest_picks_highest_version() {
        let mut reg = ModuleRegistry::new();
        reg.register(module("theory-core", "1.0.0", &[])).unwrap();
        reg.register(module("theory-core", "1.2.0", &[])).unwrap();
        reg.register(module("theory-core", "1.1.9", &[])).unwrap();
        assert_eq!(reg.latest("theory-core").unwrap().version, ModuleVersion::new(1, 2, 0));
        assert!(reg.get("theory-core", ModuleVersion::new(1, 1, 9)).is_ok());
        assert!(matches!(
            reg.get("theory-core", ModuleVersion::new(2, 0, 0)),
            Err(ModuleError::VersionNotRegistered { .. })
        ));
    }

    #[test]
    fn duplicate_registration() {
        let mut reg = ModuleRegistry::new();
        reg.register(module("a", "1.0.0", &[])).unwrap();
        reg.register(module("a", "1.0.0", &[])).unwrap();
        let changed = KnowledgeModule::new("a", ModuleVersion::new(1, 0, 0), Tier::Standard, "other.").unwrap();
        assert!(matches!(reg.register(changed), Err(ModuleError::VersionConflict { .. })));
    }

    #[test]
    fn load_order_is_topological() {
        let mut reg = ModuleRegistry::new();
        reg.register(module("base", "1.0.0", &[])).unwrap();
        reg.register(module("mid", "1.0.0", &["base"])).unwrap();
        reg.register(module("top", "1.0.0", &["mid", "base"])).unwrap();
        let order: Vec<String> = reg.load_order("top").unwrap().iter().map(|m| m.id.clone()).collect();
        assert_eq!(order, vec!["base", "mid", "top"]);
    }

    #[test]
    fn cycles_and_unknown_dependencies_are_errors() {
        let mut reg = ModuleRegistry::new();
        reg.register(module("a", "1.0.0", &["b"])).unwrap();
        reg.register(module("b", "1.0.0", &["a"])).unwrap();
        reg.register(module("c", "1.0.0", &["missing"])).unwrap();
        match reg.load_order("a") {
            Err(ModuleError::DependencyCycle { path }) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(matches!(reg.load_order("c"), Err(ModuleError::NotRegistered { .. })));
    }
}
