//! Diff and rule evaluation between the stored and the current configuration.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::debug;

use crate::error::ConfigError;
use crate::phase::Phase;

use super::diff::Changelog;
use super::pattern::{MatchedEntry, PathPattern};
use super::rules::{Lifecycle, ReducerRule, Rule, RulesManifest, SafeCondition};

/// Kind of a rule violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// An immutable path changed.
    Immutable,
    /// A reducer path changed in a way its migration cannot handle.
    ReducerUnsupported,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immutable => write!(f, "immutable"),
            Self::ReducerUnsupported => write!(f, "unsupported"),
        }
    }
}

/// A change that a rule forbids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// Phase whose rules were violated.
    pub phase: Phase,
    /// Kind of violation.
    pub kind: ViolationKind,
    /// Concrete path of the offending change.
    pub path: String,
    /// Previous value.
    pub from: Value,
    /// New value.
    pub to: Value,
    /// Rule description or unsupported transition reason.
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} change at {}: {} -> {}",
            self.phase, self.kind, self.path, self.from, self.to
        )?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

/// A supported reducer transition, run as a migration hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveReducer {
    /// Reducer identifier.
    pub key: String,
    /// When the migration runs.
    #[serde(serialize_with = "serialize_display")]
    pub lifecycle: Lifecycle,
    /// Concrete path of the change.
    pub path: String,
    /// Previous value.
    pub from: Value,
    /// New value.
    pub to: Value,
}

fn serialize_display<S: serde::Serializer>(lifecycle: &Lifecycle, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(lifecycle)
}

/// Outcome of checking a changelog against a whole rules manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleReport {
    /// Changes the rules forbid.
    pub violations: Vec<Violation>,
    /// Reducer migrations to run.
    pub active_reducers: Vec<ActiveReducer>,
}

/// Compares a stored configuration with the current one.
#[derive(Debug, Clone)]
pub struct Checker {
    stored: Value,
    current: Value,
}

impl Checker {
    /// Creates a checker over two parsed configuration trees.
    #[must_use]
    pub const fn new(stored: Value, current: Value) -> Self {
        Self { stored, current }
    }

    /// Creates a checker from the stored configuration document.
    ///
    /// # Errors
    ///
    /// Returns `StoredConfigUnreadable` if the stored document cannot be
    /// parsed into a map.
    pub fn from_stored_bytes(stored: &[u8], current: Value) -> Result<Self, ConfigError> {
        let unreadable = |message: String| ConfigError::StoredConfigUnreadable { message };

        let text = std::str::from_utf8(stored).map_err(|e| unreadable(e.to_string()))?;
        let tree: Value = serde_yaml::from_str(text).map_err(|e| unreadable(e.to_string()))?;
        if !tree.is_object() {
            return Err(unreadable(String::from("stored configuration is not a map")));
        }

        Ok(Self::new(tree, current))
    }

    /// Returns the stored configuration tree.
    #[must_use]
    pub const fn stored(&self) -> &Value {
        &self.stored
    }

    /// Computes the structural diff from the stored to the current tree.
    #[must_use]
    pub fn generate_diff(&self) -> Changelog {
        let changelog = Changelog::between(&self.stored, &self.current);
        debug!("Configuration diff has {} change(s)", changelog.len());
        changelog
    }

    /// Checks a changelog against the rules of every phase.
    #[must_use]
    pub fn evaluate(changelog: &Changelog, manifest: &RulesManifest) -> RuleReport {
        let mut report = RuleReport::default();

        for phase in Phase::APPLY_ORDER {
            let Some(rules) = manifest.for_phase(phase) else {
                continue;
            };
            let retained = Self::filter_safe_immutable_rules(changelog, &rules.immutable);
            report
                .violations
                .extend(Self::assert_immutable_violations(phase, changelog, &retained));
            report.violations.extend(Self::assert_reducer_unsupported_violations(
                phase,
                changelog,
                &rules.reducers,
            ));
            report
                .active_reducers
                .extend(Self::active_reducers(changelog, &rules.reducers));
        }

        report
    }

    /// Drops the rules whose aggregate safe conditions hold over the
    /// changelog.
    #[must_use]
    pub fn filter_safe_immutable_rules<'a>(changelog: &Changelog, rules: &'a [Rule]) -> Vec<&'a Rule> {
        rules
            .iter()
            .filter(|rule| {
                let entries = rule.path.match_all(changelog);
                let safe = aggregate_holds(&rule.safe, &rule.path, &entries);
                if safe {
                    debug!("Rule {} is satisfied by a safe condition", rule.path);
                }
                !safe
            })
            .collect()
    }

    /// Reports every change touching an immutable path, unless a per-entry
    /// safe condition allows it.
    #[must_use]
    pub fn assert_immutable_violations(
        phase: Phase,
        changelog: &Changelog,
        rules: &[&Rule],
    ) -> Vec<Violation> {
        let mut violations = Vec::new();

        for rule in rules {
            for entry in rule.path.match_all(changelog) {
                if entry_holds(&rule.safe, &entry) {
                    continue;
                }
                violations.push(violation(
                    phase,
                    ViolationKind::Immutable,
                    entry,
                    rule.description.clone().unwrap_or_default(),
                ));
            }
        }

        violations
    }

    /// Reports every reducer change performing an unsupported transition,
    /// unless a safe condition allows it.
    #[must_use]
    pub fn assert_reducer_unsupported_violations(
        phase: Phase,
        changelog: &Changelog,
        reducers: &[ReducerRule],
    ) -> Vec<Violation> {
        let mut violations = Vec::new();

        for reducer in reducers {
            let entries = reducer.path.match_all(changelog);
            if aggregate_holds(&reducer.safe, &reducer.path, &entries) {
                continue;
            }

            for entry in entries {
                let Some(unsupported) = reducer.unsupported.iter().find(|u| u.matches(&entry)) else {
                    continue;
                };
                if entry_holds(&reducer.safe, &entry) {
                    continue;
                }
                let reason = format!("{}: {}", reducer.key, unsupported.reason);
                violations.push(violation(phase, ViolationKind::ReducerUnsupported, entry, reason));
            }
        }

        violations
    }

    /// Returns the reducer transitions that need a migration hook.
    #[must_use]
    pub fn active_reducers(changelog: &Changelog, reducers: &[ReducerRule]) -> Vec<ActiveReducer> {
        let mut active = Vec::new();

        for reducer in reducers {
            for entry in reducer.path.match_all(changelog) {
                if reducer.unsupported.iter().any(|u| u.matches(&entry)) {
                    continue;
                }
                active.push(ActiveReducer {
                    key: reducer.key.clone(),
                    lifecycle: reducer.lifecycle,
                    path: entry.dotted_path(),
                    from: entry.from,
                    to: entry.to,
                });
            }
        }

        active
    }
}

fn aggregate_holds(conditions: &[SafeCondition], pattern: &PathPattern, entries: &[MatchedEntry]) -> bool {
    conditions
        .iter()
        .filter(|c| c.is_aggregate())
        .any(|c| c.holds_for_all(pattern, entries))
}

fn entry_holds(conditions: &[SafeCondition], entry: &MatchedEntry) -> bool {
    conditions
        .iter()
        .filter(|c| !c.is_aggregate())
        .any(|c| c.holds_for(entry))
}

fn violation(phase: Phase, kind: ViolationKind, entry: MatchedEntry, reason: String) -> Violation {
    Violation {
        phase,
        kind,
        path: entry.dotted_path(),
        from: entry.from,
        to: entry.to,
        reason,
    }
}
