//! Namespaced in-memory key-value store.

use dashmap::DashMap;
use serde_json::Value;

/// Default namespace when the caller does not supply one.
pub(crate) const DEFAULT_NAMESPACE: &str = "global";

/// Ephemeral key-value store, namespaced by `(namespace, key)`.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<(String, String), Value>,
}

impl KvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one.
    pub fn set(&self, namespace: &str, key: &str, value: Value) {
        self.entries
            .insert((namespace.to_string(), key.to_string()), value);
    }

    /// Get a value.
    #[must_use]
    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Delete a value. Returns `true` if it existed.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        self.entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some()
    }

    /// Keys in a namespace, sorted.
    #[must_use]
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    /// All namespaces with at least one entry, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// Number of entries across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let store = KvStore::new();
        store.set("global", "k", json!("v"));
        assert_eq!(store.get("global", "k"), Some(json!("v")));
        assert!(store.delete("global", "k"));
        assert!(!store.delete("global", "k"));
        assert_eq!(store.get("global", "k"), None);
    }

    #[test]
    fn test_namespaces_isolated() {
        let store = KvStore::new();
        store.set("a", "k", json!(1));
        store.set("b", "k", json!(2));
        assert_eq!(store.get("a", "k"), Some(json!(1)));
        assert_eq!(store.get("b", "k"), Some(json!(2)));
        assert_eq!(store.namespaces(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_keys_sorted() {
        let store = KvStore::new();
        store.set("ns", "beta", json!(1));
        store.set("ns", "alpha", json!(2));
        assert_eq!(
            store.keys("ns"),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }
}
