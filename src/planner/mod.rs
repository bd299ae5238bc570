//! Planning module: what changed and whether it may be applied.
//!
//! This module compares the stored configuration with the current one,
//! evaluates the distribution's immutability and reducer rules against the
//! resulting changelog, and reads Terraform plans to find destructive
//! actions.

mod checker;
mod diff;
mod pattern;
mod rules;
mod tfplan;

pub use checker::{ActiveReducer, Checker, RuleReport, Violation, ViolationKind};
pub use diff::{Change, ChangeKind, Changelog};
pub use pattern::{MatchedEntry, PathPattern, Segment};
pub use rules::{
    Lifecycle, PhaseRules, ReducerRule, Rule, RulesManifest, SafeCondition,
    UnsupportedTransition, rules_path,
};
pub use tfplan::{PlanSummary, parse_plan};
