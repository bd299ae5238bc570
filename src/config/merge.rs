//! Layered configuration merging.
//!
//! A [`Merger`] combines a base model (defaults) with a custom model
//! (overrides). Custom values win; the base is the fallback layer. Mergers are
//! chained to build the effective configuration of a phase: distribution
//! defaults, then the user spec, then data discovered at runtime.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::MergeError;

use super::model::MergeModel;

/// Merges the selected sub-trees of two models.
#[derive(Debug, Clone)]
pub struct Merger {
    /// Defaults layer.
    base: MergeModel,
    /// Overrides layer.
    custom: MergeModel,
}

impl Merger {
    /// Creates a merger over a base and a custom model.
    #[must_use]
    pub const fn new(base: MergeModel, custom: MergeModel) -> Self {
        Self { base, custom }
    }

    /// Returns the base model.
    #[must_use]
    pub const fn base(&self) -> &MergeModel {
        &self.base
    }

    /// Returns the custom model.
    #[must_use]
    pub const fn custom(&self) -> &MergeModel {
        &self.custom
    }

    /// Merges the custom sub-tree over the base sub-tree.
    ///
    /// Neither model is modified.
    ///
    /// # Errors
    ///
    /// Returns an error if either model path does not resolve to a map.
    pub fn merge(&self) -> Result<Map<String, Value>, MergeError> {
        let base = self.base.get()?;
        let custom = self.custom.get()?;
        Ok(merge_maps(base, custom))
    }

    /// Merges and writes the result back into a copy of the base model.
    ///
    /// The returned model carries the whole base tree with its selected
    /// sub-tree replaced by the merge result, ready to be used as the base of
    /// the next merger in a chain.
    ///
    /// # Errors
    ///
    /// Returns an error if either model path does not resolve to a map.
    pub fn merge_into_base(&self) -> Result<MergeModel, MergeError> {
        let merged = self.merge()?;
        let mut model = self.base.clone();
        model.walk(Value::Object(merged))?;
        Ok(model)
    }
}

/// Deep-merges two maps key by key, `custom` winning on conflicts.
#[must_use]
pub fn merge_maps(base: &Map<String, Value>, custom: &Map<String, Value>) -> Map<String, Value> {
    let mut result = base.clone();

    for (key, custom_value) in custom {
        let merged = match result.get(key) {
            Some(base_value) => merge_values(base_value, custom_value),
            None => custom_value.clone(),
        };
        result.insert(key.clone(), merged);
    }

    result
}

/// Merges two values following the override rules.
///
/// Lists are merged by position: map elements at the same index are merged,
/// other element pairs take the custom element, and the tail of the longer
/// list is kept as is.
#[must_use]
pub fn merge_values(base: &Value, custom: &Value) -> Value {
    match (base, custom) {
        (Value::Object(b), Value::Object(c)) => Value::Object(merge_maps(b, c)),
        (Value::Array(b), Value::Array(c)) => Value::Array(merge_lists(b, c)),
        _ => custom.clone(),
    }
}

fn merge_lists(base: &[Value], custom: &[Value]) -> Vec<Value> {
    if base.len() != custom.len() {
        debug!(
            "Merging lists of different length ({} base, {} custom) by position",
            base.len(),
            custom.len()
        );
    }

    let len = base.len().max(custom.len());
    (0..len)
        .map(|i| match (base.get(i), custom.get(i)) {
            (Some(Value::Object(b)), Some(Value::Object(c))) => Value::Object(merge_maps(b, c)),
            (_, Some(c)) => c.clone(),
            (Some(b), None) => b.clone(),
            (None, None) => Value::Null,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::lookup;
    use serde_json::json;

    fn as_map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected a map"),
        }
    }

    fn merge(base: Value, custom: Value) -> Value {
        Value::Object(merge_maps(&as_map(base), &as_map(custom)))
    }

    #[test]
    fn test_custom_wins_and_base_fills_in() {
        let base = json!({ "a": 1, "nested": { "x": "base", "y": "base" } });
        let custom = json!({ "nested": { "x": "custom" }, "b": true });

        let merged = merge(base, custom);
        assert_eq!(
            merged,
            json!({ "a": 1, "b": true, "nested": { "x": "custom", "y": "base" } })
        );
    }

    #[test]
    fn test_override_property_on_leaves() {
        let base = json!({
            "modules": { "ingress": { "type": "single", "replicas": 2 }, "logging": "loki" },
            "tags": ["a"]
        });
        let custom = json!({
            "modules": { "ingress": { "type": "dual" } },
            "tags": ["b", "c"]
        });

        let merged = merge(base, custom);
        assert_eq!(lookup(&merged, "modules.ingress.type"), Some(&json!("dual")));
        assert_eq!(lookup(&merged, "modules.ingress.replicas"), Some(&json!(2)));
        assert_eq!(lookup(&merged, "modules.logging"), Some(&json!("loki")));
        assert_eq!(lookup(&merged, "tags"), Some(&json!(["b", "c"])));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = json!({
            "pools": [ { "name": "a", "size": 1 }, { "name": "b", "size": 2 } ],
            "region": "eu-west-1",
            "vpn": { "instances": 1 }
        });
        let custom = json!({
            "pools": [ { "size": 3 } ],
            "vpn": { "port": 1194 }
        });

        let once = merge(base, custom.clone());
        let twice = merge(once.clone(), custom);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_lists_merge_by_position() {
        let base = json!({ "pools": [ { "name": "a", "size": 1 }, { "name": "b", "size": 2 } ] });
        let custom = json!({ "pools": [ { "name": "z" } ] });

        let merged = merge(base, custom);
        assert_eq!(
            merged,
            json!({ "pools": [ { "name": "z", "size": 1 }, { "name": "b", "size": 2 } ] })
        );
    }

    #[test]
    fn test_longer_custom_list_keeps_tail() {
        let base = json!({ "cidrs": ["10.0.0.0/16"] });
        let custom = json!({ "cidrs": ["10.1.0.0/16", "10.2.0.0/16"] });
        assert_eq!(
            merge(base, custom),
            json!({ "cidrs": ["10.1.0.0/16", "10.2.0.0/16"] })
        );
    }

    #[test]
    fn test_type_mismatch_custom_wins() {
        let merged = merge(json!({ "a": { "b": 1 } }), json!({ "a": "flat" }));
        assert_eq!(merged, json!({ "a": "flat" }));
    }

    #[test]
    fn test_merger_chain_keeps_layers_queryable() {
        let defaults = MergeModel::new(
            json!({ "data": { "modules": { "ingress": { "type": "single" }, "dr": "none" } } }),
            ".data",
        );
        let user = MergeModel::new(
            json!({ "spec": { "distribution": { "modules": { "dr": "velero" } } } }),
            ".spec.distribution",
        );

        let first = Merger::new(defaults, user);
        let stage = first.merge_into_base().expect("first merge");

        let injected = MergeModel::new(
            json!({ "data": { "modules": { "ingress": { "type": "dual" } } } }),
            ".data",
        );
        let second = Merger::new(stage, injected);
        let result = Value::Object(second.merge().expect("second merge"));

        assert_eq!(lookup(&result, "modules.ingress.type"), Some(&json!("dual")));
        assert_eq!(lookup(&result, "modules.dr"), Some(&json!("velero")));

        // The user layer of the first stage is still what the user wrote.
        let user_set = first.custom().get().expect("custom resolves");
        assert_eq!(user_set.get("modules"), Some(&json!({ "dr": "velero" })));
    }

    #[test]
    fn test_merge_fails_on_unresolvable_path() {
        let merger = Merger::new(
            MergeModel::new(json!({ "data": {} }), ".data"),
            MergeModel::new(json!({ "spec": {} }), ".spec.distribution"),
        );
        assert!(matches!(merger.merge(), Err(MergeError::KeyNotFound { .. })));
    }
}
