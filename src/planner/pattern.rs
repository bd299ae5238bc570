//! Rule path patterns.
//!
//! A pattern is a dotted path whose segments are either literal keys (list
//! indices included) or `*`, matching exactly one segment of any value.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::RulesError;

use super::diff::{Change, ChangeKind};

/// One segment of a path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal key or list index.
    Key(String),
    /// Any single segment.
    Any,
}

impl Segment {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Key(k) => k == segment,
            Self::Any => true,
        }
    }
}

/// A compiled rule path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// A change as seen through a pattern.
///
/// For changes at or below the pattern this is the change itself. For changes
/// above it (a whole subtree replaced), one entry is synthesized per concrete
/// path the pattern resolves to inside the old and new subtrees.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedEntry {
    /// Concrete path of the entry.
    pub path: Vec<String>,
    /// Previous value.
    pub from: Value,
    /// New value.
    pub to: Value,
    /// Kind of change.
    pub kind: ChangeKind,
}

impl MatchedEntry {
    /// Returns the path as a dotted selector.
    #[must_use]
    pub fn dotted_path(&self) -> String {
        format!(".{}", self.path.join("."))
    }
}

impl PathPattern {
    /// Parses a dotted pattern such as `.spec.kubernetes.nodePools.*.size`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPattern` for an empty pattern or an empty segment.
    pub fn parse(raw: &str) -> Result<Self, RulesError> {
        let trimmed = raw.strip_prefix('.').unwrap_or(raw);
        if trimmed.is_empty() {
            return Err(RulesError::InvalidPattern {
                pattern: raw.to_string(),
            });
        }

        let segments = trimmed
            .split('.')
            .map(|s| match s {
                "" => Err(RulesError::InvalidPattern {
                    pattern: raw.to_string(),
                }),
                "*" => Ok(Segment::Any),
                key => Ok(Segment::Key(key.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Returns the pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the compiled segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the entries of `change` this pattern covers.
    #[must_use]
    pub fn match_change(&self, change: &Change) -> Vec<MatchedEntry> {
        let shared = self.segments.len().min(change.path.len());
        let prefix_matches = self.segments[..shared]
            .iter()
            .zip(&change.path[..shared])
            .all(|(p, s)| p.matches(s));
        if !prefix_matches {
            return Vec::new();
        }

        if self.segments.len() <= change.path.len() {
            return vec![MatchedEntry {
                path: change.path.clone(),
                from: change.from.clone(),
                to: change.to.clone(),
                kind: change.kind,
            }];
        }

        let remainder = &self.segments[shared..];
        let mut concrete: Vec<Vec<String>> = Vec::new();
        expand(&change.from, remainder, &mut Vec::new(), &mut concrete);
        expand(&change.to, remainder, &mut Vec::new(), &mut concrete);

        concrete
            .into_iter()
            .filter_map(|rest| {
                let from = resolve(&change.from, &rest).cloned().unwrap_or(Value::Null);
                let to = resolve(&change.to, &rest).cloned().unwrap_or(Value::Null);
                let kind = match (&from, &to) {
                    _ if from == to => return None,
                    (Value::Null, _) => ChangeKind::Create,
                    (_, Value::Null) => ChangeKind::Delete,
                    _ => ChangeKind::Update,
                };
                let mut path = change.path.clone();
                path.extend(rest);
                Some(MatchedEntry { path, from, to, kind })
            })
            .collect()
    }

    /// Returns the entries of every change in `changes` this pattern covers.
    pub fn match_all<'a, I>(&self, changes: I) -> Vec<MatchedEntry>
    where
        I: IntoIterator<Item = &'a Change>,
    {
        changes
            .into_iter()
            .flat_map(|c| self.match_change(c))
            .collect()
    }
}

impl TryFrom<String> for PathPattern {
    type Error = RulesError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn children(value: &Value) -> Vec<(String, &Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    }
}

fn child<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn resolve<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, segment| child(node, segment))
}

fn expand(value: &Value, pattern: &[Segment], prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    let Some((first, rest)) = pattern.split_first() else {
        if !out.contains(prefix) {
            out.push(prefix.clone());
        }
        return;
    };

    match first {
        Segment::Key(key) => {
            if let Some(next) = child(value, key) {
                prefix.push(key.clone());
                expand(next, rest, prefix, out);
                prefix.pop();
            }
        }
        Segment::Any => {
            for (key, next) in children(value) {
                prefix.push(key);
                expand(next, rest, prefix, out);
                prefix.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(path: &str, from: Value, to: Value, kind: ChangeKind) -> Change {
        Change {
            path: path.split('.').map(String::from).collect(),
            from,
            to,
            kind,
        }
    }

    #[test]
    fn test_parse() {
        let p = PathPattern::parse(".spec.nodePools.*.size").expect("valid pattern");
        assert_eq!(p.segments().len(), 4);
        assert_eq!(p.segments()[2], Segment::Any);
        assert!(PathPattern::parse(".").is_err());
        assert!(PathPattern::parse(".spec..size").is_err());
    }

    #[test]
    fn test_exact_and_descendant_match() {
        let p = PathPattern::parse(".spec.infrastructure.vpc").expect("valid pattern");

        let exact = change("spec.infrastructure.vpc", json!({}), json!(null), ChangeKind::Delete);
        assert_eq!(p.match_change(&exact).len(), 1);

        let below = change(
            "spec.infrastructure.vpc.network.cidr",
            json!("10.0.0.0/16"),
            json!("10.1.0.0/16"),
            ChangeKind::Update,
        );
        let entries = p.match_change(&below);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dotted_path(), ".spec.infrastructure.vpc.network.cidr");

        let sibling = change("spec.infrastructure.vpn", json!(1), json!(2), ChangeKind::Update);
        assert!(p.match_change(&sibling).is_empty());
    }

    #[test]
    fn test_wildcard_match() {
        let p = PathPattern::parse(".spec.nodePools.*.size").expect("valid pattern");
        let c = change("spec.nodePools.3.size", json!(1), json!(2), ChangeKind::Update);
        assert_eq!(p.match_change(&c).len(), 1);
        let other = change("spec.nodePools.3.name", json!("a"), json!("b"), ChangeKind::Update);
        assert!(p.match_change(&other).is_empty());
    }

    #[test]
    fn test_ancestor_change_resolves_remainder() {
        let p = PathPattern::parse(".spec.nodePools.*.size").expect("valid pattern");
        let c = change(
            "spec.nodePools",
            json!([ { "name": "a", "size": 1 }, { "name": "b", "size": 2 } ]),
            json!([ { "name": "a", "size": 1 }, { "name": "b", "size": 3 }, { "size": 1 } ]),
            ChangeKind::Update,
        );

        let entries = p.match_change(&c);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dotted_path(), ".spec.nodePools.1.size");
        assert_eq!(entries[0].kind, ChangeKind::Update);
        assert_eq!(entries[1].dotted_path(), ".spec.nodePools.2.size");
        assert_eq!(entries[1].kind, ChangeKind::Create);
    }

    #[test]
    fn test_ancestor_change_without_target_matches_nothing() {
        let p = PathPattern::parse(".spec.kubernetes.apiServer.privateAccess").expect("valid pattern");
        let c = change(
            "spec.kubernetes",
            json!({ "nodePools": [] }),
            json!({ "nodePools": [ { "name": "x" } ] }),
            ChangeKind::Update,
        );
        assert!(p.match_change(&c).is_empty());
    }

    #[test]
    fn test_deserialize_from_string() {
        let p: PathPattern = serde_yaml::from_str("\".spec.a.*\"").expect("pattern should deserialize");
        assert_eq!(p.as_str(), ".spec.a.*");
        assert!(serde_yaml::from_str::<PathPattern>("\"..\"").is_err());
    }
}
