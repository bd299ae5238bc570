//! Configuration hashing for change detection.
//!
//! The hash keys the persisted upgrade state: a run can only resume a
//! previous one if the rendered configuration is the same.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a configuration tree.
    ///
    /// Maps are serialized with sorted keys, so two trees that compare equal
    /// always hash the same.
    #[must_use]
    pub fn hash_tree(&self, tree: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical(tree).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 12 characters) for display.
    #[must_use]
    pub fn short_hash(&self, tree: &Value) -> String {
        let full = self.hash_tree(tree);
        full.chars().take(12).collect()
    }
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = ConfigHasher::new();
        let tree = json!({ "spec": { "b": [1, 2], "a": "x" } });
        assert_eq!(hasher.hash_tree(&tree), hasher.hash_tree(&tree.clone()));
        assert_eq!(hasher.hash_tree(&tree).len(), 64);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let hasher = ConfigHasher::new();
        let a = json!({ "spec": { "replicas": 1 } });
        let b = json!({ "spec": { "replicas": 2 } });
        assert_ne!(hasher.hash_tree(&a), hasher.hash_tree(&b));
    }

    #[test]
    fn test_list_order_matters() {
        let hasher = ConfigHasher::new();
        assert_ne!(
            hasher.hash_tree(&json!(["a", "b"])),
            hasher.hash_tree(&json!(["b", "a"]))
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.short_hash(&json!({})).len(), 12);
    }
}
