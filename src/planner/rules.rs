//! Immutability and reducer rules.
//!
//! Rules are shipped by the distribution in `rules/<kind>.yaml`, one section
//! per phase. They are loaded once per run and never modified afterwards.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::RulesError;
use crate::phase::Phase;

use super::diff::ChangeKind;
use super::pattern::{MatchedEntry, PathPattern};

/// Rules of every phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesManifest {
    /// Infrastructure phase rules.
    #[serde(default)]
    pub infrastructure: PhaseRules,
    /// Kubernetes phase rules.
    #[serde(default)]
    pub kubernetes: PhaseRules,
    /// Distribution phase rules.
    #[serde(default)]
    pub distribution: PhaseRules,
}

/// Rules of a single phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseRules {
    /// Paths that cannot change once applied.
    #[serde(default)]
    pub immutable: Vec<Rule>,
    /// Paths whose changes need a migration.
    #[serde(default)]
    pub reducers: Vec<ReducerRule>,
}

/// An immutability rule.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// Path the rule protects.
    pub path: PathPattern,
    /// Human readable explanation.
    #[serde(default)]
    pub description: Option<String>,
    /// Conditions under which a change is allowed anyway.
    #[serde(default)]
    pub safe: Vec<SafeCondition>,
}

/// When a reducer runs relative to the distribution apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    /// Before manifests are applied.
    PreApply,
    /// After manifests are applied.
    PostApply,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreApply => write!(f, "pre-apply"),
            Self::PostApply => write!(f, "post-apply"),
        }
    }
}

/// A reducer rule: a change that is supported through a migration hook,
/// except for the listed unsupported transitions.
#[derive(Debug, Clone, Deserialize)]
pub struct ReducerRule {
    /// Identifier of the reducer, also the name of its migration script.
    pub key: String,
    /// Path the reducer watches.
    pub path: PathPattern,
    /// When the migration runs.
    pub lifecycle: Lifecycle,
    /// Human readable explanation.
    #[serde(default)]
    pub description: Option<String>,
    /// Transitions the migration cannot handle.
    #[serde(default)]
    pub unsupported: Vec<UnsupportedTransition>,
    /// Conditions under which an unsupported transition is allowed anyway.
    #[serde(default)]
    pub safe: Vec<SafeCondition>,
}

/// A transition a reducer cannot handle. A missing bound matches any value.
#[derive(Debug, Clone, Deserialize)]
pub struct UnsupportedTransition {
    /// Previous value.
    #[serde(default, deserialize_with = "deserialize_some")]
    pub from: Option<Value>,
    /// New value.
    #[serde(default, deserialize_with = "deserialize_some")]
    pub to: Option<Value>,
    /// Why the transition is unsupported.
    pub reason: String,
}

impl UnsupportedTransition {
    /// Returns true if the entry performs this transition.
    #[must_use]
    pub fn matches(&self, entry: &MatchedEntry) -> bool {
        bound_matches(self.from.as_ref(), &entry.from) && bound_matches(self.to.as_ref(), &entry.to)
    }
}

/// Condition under which a matching change is considered safe.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SafeCondition {
    /// A specific transition; a missing bound matches any value.
    Transition {
        /// Previous value.
        #[serde(default, deserialize_with = "deserialize_some")]
        from: Option<Value>,
        /// New value.
        #[serde(default, deserialize_with = "deserialize_some")]
        to: Option<Value>,
    },
    /// Every matching change adds new entries, at most `max` of them.
    AppendOnly {
        /// Maximum number of added entries.
        #[serde(default)]
        max: Option<usize>,
    },
}

impl SafeCondition {
    /// Returns true if this is an aggregate condition, evaluated over every
    /// entry a rule matches at once.
    #[must_use]
    pub const fn is_aggregate(&self) -> bool {
        matches!(self, Self::AppendOnly { .. })
    }

    /// Evaluates a per-entry condition. Aggregate conditions never hold for a
    /// single entry.
    #[must_use]
    pub fn holds_for(&self, entry: &MatchedEntry) -> bool {
        match self {
            Self::Transition { from, to } => {
                bound_matches(from.as_ref(), &entry.from) && bound_matches(to.as_ref(), &entry.to)
            }
            Self::AppendOnly { .. } => false,
        }
    }

    /// Evaluates an aggregate condition over all entries `pattern` matched.
    /// Per-entry conditions never hold in aggregate.
    #[must_use]
    pub fn holds_for_all(&self, pattern: &PathPattern, entries: &[MatchedEntry]) -> bool {
        match self {
            Self::Transition { .. } => false,
            Self::AppendOnly { max } => {
                let depth = pattern.segments().len();
                let Some(appended) = entries
                    .iter()
                    .map(|e| appended_elements(depth, e))
                    .sum::<Option<usize>>()
                else {
                    return false;
                };
                appended > 0 && max.is_none_or(|m| appended <= m)
            }
        }
    }
}

/// Number of list elements an entry appends under a pattern of `depth`
/// segments, or `None` if the entry touches anything else.
///
/// A created index directly below the pattern is a new element: an index
/// below the old length would diff as an update of that element instead. A
/// list created where there was none appends all of its elements.
fn appended_elements(depth: usize, entry: &MatchedEntry) -> Option<usize> {
    if entry.kind != ChangeKind::Create {
        return None;
    }
    if entry.path.len() == depth + 1 {
        return entry
            .path
            .last()
            .filter(|segment| segment.parse::<usize>().is_ok())
            .map(|_| 1);
    }
    if entry.path.len() == depth {
        return entry.to.as_array().map(Vec::len);
    }
    None
}

fn bound_matches(bound: Option<&Value>, actual: &Value) -> bool {
    bound.is_none_or(|b| b == actual)
}

/// Keeps an explicit `null` bound distinct from an absent one.
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RulesManifest {
    /// Parses a rules manifest from YAML.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the document is not a valid manifest.
    pub fn from_yaml(content: &str, origin: &Path) -> Result<Self, RulesError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| RulesError::Malformed {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads a rules manifest from disk.
    ///
    /// A missing file is not an error: a warning is logged and `None` is
    /// returned, which disables rule checks for the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, RulesError> {
        if !path.exists() {
            warn!(
                "Rules file {} not found, immutability checks are disabled",
                path.display()
            );
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| RulesError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let manifest = Self::from_yaml(&content, path)?;
        debug!(
            "Loaded {} immutable and {} reducer rules from {}",
            manifest.immutable_count(),
            manifest.reducer_count(),
            path.display()
        );
        Ok(Some(manifest))
    }

    /// Returns the rules of a phase. `PreFlight` has none.
    #[must_use]
    pub fn for_phase(&self, phase: Phase) -> Option<&PhaseRules> {
        match phase {
            Phase::PreFlight => None,
            Phase::Infrastructure => Some(&self.infrastructure),
            Phase::Kubernetes => Some(&self.kubernetes),
            Phase::Distribution => Some(&self.distribution),
        }
    }

    fn immutable_count(&self) -> usize {
        self.infrastructure.immutable.len()
            + self.kubernetes.immutable.len()
            + self.distribution.immutable.len()
    }

    fn reducer_count(&self) -> usize {
        self.infrastructure.reducers.len()
            + self.kubernetes.reducers.len()
            + self.distribution.reducers.len()
    }
}

/// Returns the path of the rules manifest for a cluster kind.
#[must_use]
pub fn rules_path(distro_dir: &Path, kind: &str) -> PathBuf {
    distro_dir
        .join("rules")
        .join(format!("{}.yaml", kind.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
infrastructure:
  immutable:
    - path: .spec.infrastructure.vpc.network.cidr
      description: the VPC CIDR cannot change
kubernetes:
  immutable:
    - path: .spec.kubernetes.nodePools
      safe:
        - kind: append-only
          max: 2
distribution:
  reducers:
    - key: ingressType
      path: .spec.distribution.modules.ingress.type
      lifecycle: pre-apply
      unsupported:
        - from: dual
          to: none
          reason: cannot remove both ingresses at once
  immutable:
    - path: .spec.distribution.modules.dr.type
      safe:
        - kind: transition
          from: null
          to: velero
"#;

    fn entry(from: Value, to: Value, kind: ChangeKind) -> MatchedEntry {
        entry_at(&["x"], from, to, kind)
    }

    fn entry_at(path: &[&str], from: Value, to: Value, kind: ChangeKind) -> MatchedEntry {
        MatchedEntry {
            path: path.iter().map(ToString::to_string).collect(),
            from,
            to,
            kind,
        }
    }

    fn pattern(raw: &str) -> PathPattern {
        PathPattern::parse(raw).expect("valid pattern")
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = RulesManifest::from_yaml(MANIFEST, Path::new("rules.yaml")).expect("valid manifest");
        assert_eq!(manifest.infrastructure.immutable.len(), 1);
        assert_eq!(manifest.distribution.reducers[0].lifecycle, Lifecycle::PreApply);
        assert_eq!(
            manifest.kubernetes.immutable[0].safe,
            vec![SafeCondition::AppendOnly { max: Some(2) }]
        );
        assert_eq!(
            manifest.distribution.immutable[0].safe,
            vec![SafeCondition::Transition {
                from: Some(Value::Null),
                to: Some(json!("velero"))
            }]
        );
        assert!(manifest.for_phase(Phase::PreFlight).is_none());
    }

    #[test]
    fn test_malformed_manifest() {
        let result = RulesManifest::from_yaml(
            "kubernetes:\n  immutable:\n    - description: no path\n",
            Path::new("rules.yaml"),
        );
        assert!(matches!(result, Err(RulesError::Malformed { .. })));

        let bad_pattern = RulesManifest::from_yaml(
            "kubernetes:\n  immutable:\n    - path: \"..\"\n",
            Path::new("rules.yaml"),
        );
        assert!(matches!(bad_pattern, Err(RulesError::Malformed { .. })));
    }

    #[test]
    fn test_missing_file_disables_checks() {
        let dir = TempDir::new().expect("temp dir");
        let loaded = RulesManifest::load(&rules_path(dir.path(), "EKSCluster")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = TempDir::new().expect("temp dir");
        let path = rules_path(dir.path(), "EKSCluster");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, MANIFEST).expect("write");

        let loaded = RulesManifest::load(&path).expect("load");
        assert!(loaded.is_some());
    }

    #[test]
    fn test_transition_condition() {
        let cond = SafeCondition::Transition {
            from: Some(Value::Null),
            to: None,
        };
        assert!(cond.holds_for(&entry(Value::Null, json!("x"), ChangeKind::Create)));
        assert!(!cond.holds_for(&entry(json!("y"), json!("x"), ChangeKind::Update)));
        assert!(!cond.holds_for_all(&pattern(".x"), &[entry(Value::Null, json!("x"), ChangeKind::Create)]));
    }

    #[test]
    fn test_append_only_condition() {
        let cond = SafeCondition::AppendOnly { max: Some(1) };
        let pools = pattern(".pools");
        let appended = entry_at(&["pools", "1"], Value::Null, json!({ "name": "b" }), ChangeKind::Create);
        let second = entry_at(&["pools", "2"], Value::Null, json!({ "name": "c" }), ChangeKind::Create);
        let edited = entry_at(&["pools", "0", "name"], json!("a"), json!("z"), ChangeKind::Update);

        assert!(cond.holds_for_all(&pools, std::slice::from_ref(&appended)));
        assert!(!cond.holds_for_all(&pools, &[appended.clone(), second]));
        assert!(!cond.holds_for_all(&pools, &[appended.clone(), edited]));
        assert!(!cond.holds_for(&appended));
        assert!(!cond.holds_for_all(&pools, &[]));
    }

    #[test]
    fn test_append_only_rejects_keys_added_to_existing_elements() {
        let cond = SafeCondition::AppendOnly { max: None };
        let pools = pattern(".spec.kubernetes.nodePools");
        let added_key = entry_at(
            &["spec", "kubernetes", "nodePools", "0", "instanceType"],
            Value::Null,
            json!("m5.xlarge"),
            ChangeKind::Create,
        );
        assert!(!cond.holds_for_all(&pools, &[added_key]));

        let keyed = entry_at(
            &["spec", "kubernetes", "nodePools", "extra"],
            Value::Null,
            json!({}),
            ChangeKind::Create,
        );
        assert!(!cond.holds_for_all(&pools, &[keyed]));
    }

    #[test]
    fn test_append_only_counts_elements_of_a_new_list() {
        let pools = pattern(".pools");
        let created = entry_at(&["pools"], Value::Null, json!([{}, {}]), ChangeKind::Create);
        assert!(SafeCondition::AppendOnly { max: None }.holds_for_all(&pools, std::slice::from_ref(&created)));
        assert!(!SafeCondition::AppendOnly { max: Some(1) }.holds_for_all(&pools, &[created]));
    }

    #[test]
    fn test_unsupported_transition_wildcards() {
        let unsupported = UnsupportedTransition {
            from: Some(json!("dual")),
            to: None,
            reason: String::from("no"),
        };
        assert!(unsupported.matches(&entry(json!("dual"), json!("none"), ChangeKind::Update)));
        assert!(!unsupported.matches(&entry(json!("single"), json!("none"), ChangeKind::Update)));
    }
}
