//! Path-scoped views over configuration trees.
//!
//! A [`MergeModel`] pairs a whole configuration tree with a dotted selector
//! (`.spec.distribution`) pointing at the sub-tree that takes part in a merge.
//! Selectors only traverse maps: arrays and scalars end the walk.

use serde_json::{Map, Value};

use crate::error::MergeError;

/// A configuration tree plus the selector of the sub-tree to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeModel {
    /// The whole configuration tree.
    content: Value,
    /// Dotted selector of the merge sub-tree.
    path: String,
}

/// Splits a dotted selector into its segments.
///
/// The leading dot is optional; `"."` and `""` select the root.
#[must_use]
pub fn selector_segments(path: &str) -> Vec<&str> {
    path.trim_start_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .collect()
}

impl MergeModel {
    /// Creates a model over `content` scoped at `path`.
    #[must_use]
    pub fn new(content: Value, path: impl Into<String>) -> Self {
        Self {
            content,
            path: path.into(),
        }
    }

    /// Creates a model from a map, scoped at `path`.
    #[must_use]
    pub fn from_map(content: Map<String, Value>, path: impl Into<String>) -> Self {
        Self::new(Value::Object(content), path)
    }

    /// Returns the selector of this model.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the whole configuration tree.
    #[must_use]
    pub const fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes the model and returns the whole configuration tree.
    #[must_use]
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Returns the map selected by the model path.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if a segment is missing and `NotAMap` if a
    /// segment (or the selected value) is not a map.
    pub fn get(&self) -> Result<&Map<String, Value>, MergeError> {
        let mut current = &self.content;
        let mut last = "";

        for segment in selector_segments(&self.path) {
            let map = current.as_object().ok_or_else(|| self.not_a_map(last))?;
            current = map.get(segment).ok_or_else(|| MergeError::KeyNotFound {
                path: self.path.clone(),
                key: segment.to_string(),
            })?;
            last = segment;
        }

        current.as_object().ok_or_else(|| self.not_a_map(last))
    }

    /// Returns the selected map, or an empty map when the selector does not
    /// resolve to anything.
    ///
    /// # Errors
    ///
    /// Returns `NotAMap` if the selector crosses a value that is not a map.
    pub fn get_or_empty(&self) -> Result<Map<String, Value>, MergeError> {
        match self.get() {
            Ok(map) => Ok(map.clone()),
            Err(MergeError::KeyNotFound { .. }) => Ok(Map::new()),
            Err(e) => Err(e),
        }
    }

    /// Writes `subtree` at the model path, replacing what was there.
    ///
    /// Intermediate segments must already exist as maps; the last segment is
    /// inserted into its parent. Walking the root replaces the whole tree.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` or `NotAMap` if the parent cannot be resolved.
    pub fn walk(&mut self, subtree: Value) -> Result<(), MergeError> {
        let segments: Vec<String> = selector_segments(&self.path)
            .into_iter()
            .map(String::from)
            .collect();

        let Some((last, parents)) = segments.split_last() else {
            if !subtree.is_object() {
                return Err(self.not_a_map("."));
            }
            self.content = subtree;
            return Ok(());
        };

        let path = self.path.clone();
        let mut current = &mut self.content;
        let mut previous = ".";

        for segment in parents {
            let map = current.as_object_mut().ok_or_else(|| MergeError::NotAMap {
                path: path.clone(),
                key: previous.to_string(),
            })?;
            current = map.get_mut(segment).ok_or_else(|| MergeError::KeyNotFound {
                path: path.clone(),
                key: segment.clone(),
            })?;
            previous = segment.as_str();
        }

        let parent = current.as_object_mut().ok_or_else(|| MergeError::NotAMap {
            path: path.clone(),
            key: previous.to_string(),
        })?;
        parent.insert(last.clone(), subtree);
        Ok(())
    }

    /// Like [`walk`](Self::walk), but creates missing intermediate maps.
    ///
    /// # Errors
    ///
    /// Returns `NotAMap` if an existing intermediate value is not a map.
    pub fn walk_creating(&mut self, subtree: Value) -> Result<(), MergeError> {
        let segments: Vec<String> = selector_segments(&self.path)
            .into_iter()
            .map(String::from)
            .collect();
        let path = self.path.clone();

        let mut current = &mut self.content;
        for (i, segment) in segments.iter().enumerate() {
            let map = current.as_object_mut().ok_or_else(|| MergeError::NotAMap {
                path: path.clone(),
                key: segment.clone(),
            })?;
            if i + 1 == segments.len() {
                map.insert(segment.clone(), subtree);
                return Ok(());
            }
            current = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        self.walk(subtree)
    }

    fn not_a_map(&self, key: &str) -> MergeError {
        MergeError::NotAMap {
            path: self.path.clone(),
            key: if key.is_empty() { ".".to_string() } else { key.to_string() },
        }
    }
}

/// Looks up a dotted selector in a tree without requiring a map at the end.
#[must_use]
pub fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    selector_segments(path)
        .into_iter()
        .try_fold(tree, |node, segment| node.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(path: &str) -> MergeModel {
        MergeModel::new(
            json!({
                "spec": {
                    "distribution": { "modules": { "ingress": { "type": "single" } } },
                    "nodePools": [ { "name": "infra" } ],
                    "version": "v1.29.0"
                }
            }),
            path,
        )
    }

    #[test]
    fn test_get_resolves_nested_map() {
        let m = model(".spec.distribution.modules");
        let sub = m.get().expect("path should resolve");
        assert!(sub.contains_key("ingress"));
    }

    #[test]
    fn test_get_root_without_leading_dot() {
        let m = model("spec");
        assert!(m.get().expect("root should resolve").contains_key("version"));
        let root = model(".");
        assert!(root.get().expect("root should resolve").contains_key("spec"));
    }

    #[test]
    fn test_get_missing_key() {
        let m = model(".spec.kubernetes");
        assert_eq!(
            m.get(),
            Err(MergeError::KeyNotFound {
                path: String::from(".spec.kubernetes"),
                key: String::from("kubernetes"),
            })
        );
    }

    #[test]
    fn test_get_through_array_is_not_a_map() {
        let m = model(".spec.nodePools.name");
        assert!(matches!(m.get(), Err(MergeError::NotAMap { key, .. }) if key == "nodePools"));

        let scalar = model(".spec.version");
        assert!(matches!(scalar.get(), Err(MergeError::NotAMap { key, .. }) if key == "version"));
    }

    #[test]
    fn test_walk_replaces_subtree() {
        let mut m = model(".spec.distribution");
        m.walk(json!({ "modules": {} })).expect("walk should succeed");
        assert_eq!(lookup(m.content(), ".spec.distribution.modules"), Some(&json!({})));
        assert_eq!(lookup(m.content(), ".spec.version"), Some(&json!("v1.29.0")));
    }

    #[test]
    fn test_walk_fails_on_missing_parent() {
        let mut m = model(".spec.kubernetes.vpcId");
        assert!(matches!(
            m.walk(json!("vpc-1")),
            Err(MergeError::KeyNotFound { key, .. }) if key == "kubernetes"
        ));
    }

    #[test]
    fn test_walk_creating_builds_parents() {
        let mut m = model(".spec.kubernetes.vpcId");
        m.walk_creating(json!("vpc-1")).expect("walk should create parents");
        assert_eq!(lookup(m.content(), "spec.kubernetes.vpcId"), Some(&json!("vpc-1")));
    }

    #[test]
    fn test_get_or_empty() {
        assert!(model(".spec.missing").get_or_empty().expect("missing is empty").is_empty());
        assert!(model(".spec.version.x").get_or_empty().is_err());
    }
}
