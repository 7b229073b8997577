//! Named connection target registry.

use crate::error::{OmniError, OmniResult};
use crate::models::ConnectionTarget;

use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory map from configuration name to [`ConnectionTarget`].
///
/// Pools snapshot their target at creation time, so overwriting or clearing
/// an entry never affects a live pool. Clearing does not close anything.
#[derive(Default)]
pub struct ConfigRegistry {
    configs: RwLock<HashMap<String, ConnectionTarget>>,
}

impl ConfigRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the target registered under `name`.
    pub fn register(&self, name: impl Into<String>, target: ConnectionTarget) {
        let name = name.into();
        tracing::debug!(
            config_name = %name,
            url = %target.display_url(),
            tunneled = target.requires_tunnel(),
            "Registering database configuration"
        );
        self.configs.write().insert(name, target);
    }

    /// Look up the target registered under `name`.
    pub fn lookup(&self, name: &str) -> OmniResult<ConnectionTarget> {
        self.configs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| OmniError::config_not_found(name))
    }

    /// Check whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.configs.read().contains_key(name)
    }

    /// Remove a single entry.
    pub fn remove(&self, name: &str) -> Option<ConnectionTarget> {
        self.configs.write().remove(name)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.configs.write().clear();
        tracing::debug!("Cleared database configurations");
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered configurations.
    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DriverKind;

    fn target(host: &str) -> ConnectionTarget {
        ConnectionTarget::new(DriverKind::MySql, host, "orders", "app", "pw")
    }

    #[test]
    fn test_lookup_unknown_name_fails() {
        let registry = ConfigRegistry::new();
        let err = registry.lookup("missing").unwrap_err();
        assert!(matches!(err, OmniError::ConfigNotFound { ref name } if name == "missing"));
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = ConfigRegistry::new();
        registry.register("main", target("a"));
        registry.register("main", target("b"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("main").unwrap().host, "b");
    }

    #[test]
    fn test_clear_removes_everything() {
        let registry = ConfigRegistry::new();
        registry.register("one", target("a"));
        registry.register("two", target("b"));
        assert_eq!(registry.names(), vec!["one".to_string(), "two".to_string()]);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.lookup("one").is_err());
    }

    #[test]
    fn test_remove_single_entry() {
        let registry = ConfigRegistry::new();
        registry.register("one", target("a"));
        assert!(registry.remove("one").is_some());
        assert!(registry.remove("one").is_none());
        assert!(!registry.contains("one"));
    }
}
