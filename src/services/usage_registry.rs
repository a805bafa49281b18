use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Tracks which consumers currently depend on each database
///
/// A registered pair means the database resource must be kept alive and its
/// configuration treated as non-editable. Registrations never expire on their
/// own; consumers remove them explicitly.
#[derive(Default)]
pub struct UsageRegistry {
    registrations: Mutex<HashMap<String, HashSet<String>>>,
}

impl UsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `consumer` depends on `name`. Returns true if the pair was
    /// not already present; registering twice has no additional effect.
    pub fn register(&self, name: &str, consumer: &str) -> bool {
        let mut registrations = self.registrations.lock().unwrap();
        registrations
            .entry(name.to_string())
            .or_default()
            .insert(consumer.to_string())
    }

    /// Remove the pair if present. Returns true if it existed.
    pub fn unregister(&self, name: &str, consumer: &str) -> bool {
        let mut registrations = self.registrations.lock().unwrap();
        let removed = registrations
            .get_mut(name)
            .map(|consumers| consumers.remove(consumer))
            .unwrap_or(false);
        if removed && registrations.get(name).is_some_and(HashSet::is_empty) {
            registrations.remove(name);
        }
        removed
    }

    /// True iff at least one registration exists for `name`
    pub fn has_any(&self, name: &str) -> bool {
        self.registrations
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|consumers| !consumers.is_empty())
    }

    /// Consumers currently registered against `name`, in no particular order
    pub fn consumers_of(&self, name: &str) -> Vec<String> {
        self.registrations
            .lock()
            .unwrap()
            .get(name)
            .map(|consumers| consumers.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = UsageRegistry::new();
        assert!(registry.register("db1", "tableA"));
        assert!(!registry.register("db1", "tableA"));
        assert_eq!(registry.consumers_of("db1").len(), 1);
    }

    #[test]
    fn test_multi_owner_transitions() {
        let registry = UsageRegistry::new();
        registry.register("db1", "tableA");
        registry.register("db1", "tableB");
        assert!(registry.unregister("db1", "tableA"));
        assert!(registry.has_any("db1"));
        assert!(registry.unregister("db1", "tableB"));
        assert!(!registry.has_any("db1"));
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = UsageRegistry::new();
        assert!(!registry.unregister("db1", "tableA"));
        assert!(!registry.has_any("db1"));
    }

    #[test]
    fn test_names_are_independent() {
        let registry = UsageRegistry::new();
        registry.register("db1", "tableA");
        assert!(!registry.has_any("db2"));
        assert!(registry.consumers_of("db2").is_empty());
    }
}
