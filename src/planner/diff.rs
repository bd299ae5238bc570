//! Structural diff between two configuration trees.
//!
//! Maps are compared key by key and lists index by index. Every leaf that
//! differs becomes one [`Change`]; a subtree that only exists on one side is
//! reported once, as a whole, at its root.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Kind of a configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// The value did not exist before.
    Create,
    /// The value changed.
    Update,
    /// The value no longer exists.
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single change between the stored and the current configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    /// Path segments from the root; list indices are decimal segments.
    pub path: Vec<String>,
    /// Previous value (`Null` for creations).
    pub from: Value,
    /// New value (`Null` for deletions).
    pub to: Value,
    /// Kind of change.
    pub kind: ChangeKind,
}

impl Change {
    /// Returns the path as a dotted selector.
    #[must_use]
    pub fn dotted_path(&self) -> String {
        format!(".{}", self.path.join("."))
    }
}

/// Ordered list of changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Changelog {
    /// Changes in tree traversal order.
    pub changes: Vec<Change>,
}

impl Changelog {
    /// Computes the changelog turning `from` into `to`.
    #[must_use]
    pub fn between(from: &Value, to: &Value) -> Self {
        let mut changes = Vec::new();
        let mut path = Vec::new();
        diff_values(&mut path, from, to, &mut changes);
        Self { changes }
    }

    /// Returns true if there are no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterates over the changes.
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Applies the changelog to a tree.
    ///
    /// Applying the changelog of `(a, b)` to `a` yields `b`. Deleted list
    /// entries are removed from the highest index down so earlier indices
    /// stay valid.
    #[must_use]
    pub fn apply(&self, tree: &Value) -> Value {
        let mut result = tree.clone();

        for change in self.changes.iter().filter(|c| c.kind != ChangeKind::Delete) {
            set_at(&mut result, &change.path, change.to.clone());
        }

        let mut deletions: Vec<&Change> = self
            .changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Delete)
            .collect();
        deletions.reverse();
        for change in deletions {
            remove_at(&mut result, &change.path);
        }

        result
    }
}

impl<'a> IntoIterator for &'a Changelog {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

fn push(changes: &mut Vec<Change>, path: &[String], from: Value, to: Value, kind: ChangeKind) {
    changes.push(Change {
        path: path.to_vec(),
        from,
        to,
        kind,
    });
}

fn diff_values(path: &mut Vec<String>, from: &Value, to: &Value, changes: &mut Vec<Change>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                path.push(key.clone());
                match b.get(key) {
                    Some(new) => diff_values(path, old, new, changes),
                    None => push(changes, path, old.clone(), Value::Null, ChangeKind::Delete),
                }
                path.pop();
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    path.push(key.clone());
                    push(changes, path, Value::Null, new.clone(), ChangeKind::Create);
                    path.pop();
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                path.push(i.to_string());
                match (a.get(i), b.get(i)) {
                    (Some(old), Some(new)) => diff_values(path, old, new, changes),
                    (Some(old), None) => {
                        push(changes, path, old.clone(), Value::Null, ChangeKind::Delete);
                    }
                    (None, Some(new)) => {
                        push(changes, path, Value::Null, new.clone(), ChangeKind::Create);
                    }
                    (None, None) => {}
                }
                path.pop();
            }
        }
        _ if from == to => {}
        _ => push(changes, path, from.clone(), to.clone(), ChangeKind::Update),
    }
}

fn set_at(tree: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *tree = value;
        return;
    };

    let mut current = tree;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return,
            },
            _ => return,
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items[i] = value;
                } else {
                    items.push(value);
                }
            }
        }
        _ => {}
    }
}

fn remove_at(tree: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        *tree = Value::Null;
        return;
    };

    let mut current = tree;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(segment) {
                Some(v) => v,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return,
            },
            _ => return,
        };
    }

    match current {
        Value::Object(map) => {
            map.shift_remove(last);
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(log: &Changelog) -> Vec<String> {
        log.iter().map(Change::dotted_path).collect()
    }

    #[test]
    fn test_identical_trees_have_no_changes() {
        let tree = json!({ "spec": { "a": [1, 2, { "b": null }] } });
        assert!(Changelog::between(&tree, &tree).is_empty());
    }

    #[test]
    fn test_leaf_update_create_delete() {
        let from = json!({ "spec": { "version": "1.28", "old": true } });
        let to = json!({ "spec": { "version": "1.29", "new": { "x": 1 } } });

        let log = Changelog::between(&from, &to);
        assert_eq!(paths(&log), vec![".spec.version", ".spec.old", ".spec.new"]);
        assert_eq!(log.changes[0].kind, ChangeKind::Update);
        assert_eq!(log.changes[1].kind, ChangeKind::Delete);
        assert_eq!(log.changes[2].kind, ChangeKind::Create);
        assert_eq!(log.changes[2].to, json!({ "x": 1 }));
    }

    #[test]
    fn test_lists_compared_by_index() {
        let from = json!({ "pools": [ { "name": "a" } ] });
        let to = json!({ "pools": [ { "name": "b" }, { "name": "c" } ] });

        let log = Changelog::between(&from, &to);
        assert_eq!(paths(&log), vec![".pools.0.name", ".pools.1"]);
        assert_eq!(log.changes[1].kind, ChangeKind::Create);
    }

    #[test]
    fn test_type_change_is_update() {
        let log = Changelog::between(&json!({ "a": { "b": 1 } }), &json!({ "a": [1] }));
        assert_eq!(log.len(), 1);
        assert_eq!(log.changes[0].kind, ChangeKind::Update);
    }

    #[test]
    fn test_apply_round_trip() {
        let from = json!({
            "spec": {
                "pools": [ { "name": "a", "size": 1 }, { "name": "b" }, { "name": "c" } ],
                "vpn": { "port": 1194 },
                "region": "eu-west-1"
            }
        });
        let to = json!({
            "spec": {
                "pools": [ { "name": "a", "size": 3 } ],
                "region": "eu-west-1",
                "dr": { "type": "velero" }
            }
        });

        let log = Changelog::between(&from, &to);
        assert_eq!(log.apply(&from), to);
        assert!(Changelog::between(&log.apply(&from), &to).is_empty());
    }
}
