//! Persisted run state.
//!
//! The upgrade state records the outcome of every sub-phase of the current
//! configuration, so that a failed run can be resumed where it stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::phase::SubPhase;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Outcome of a sub-phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    /// Not run yet.
    #[default]
    Pending,
    /// Completed successfully.
    Success,
    /// Failed.
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Sub-phase outcomes of one configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeState {
    /// State format version.
    pub version: String,
    /// Hash of the rendered configuration this state belongs to.
    pub config_hash: String,
    /// When the first run of this configuration started.
    pub started_at: DateTime<Utc>,
    /// When the state was last updated.
    pub updated_at: DateTime<Utc>,
    /// Outcome per sub-phase.
    pub statuses: BTreeMap<SubPhase, PhaseStatus>,
    /// When a run of this configuration went through every selected phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpgradeState {
    /// Creates a state where every sub-phase is pending.
    #[must_use]
    pub fn new(config_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            config_hash: config_hash.into(),
            started_at: now,
            updated_at: now,
            statuses: SubPhase::ALL
                .iter()
                .map(|s| (*s, PhaseStatus::Pending))
                .collect(),
            finished_at: None,
        }
    }

    /// Returns the status of a sub-phase.
    #[must_use]
    pub fn status(&self, sub_phase: SubPhase) -> PhaseStatus {
        self.statuses.get(&sub_phase).copied().unwrap_or_default()
    }

    /// Records the status of a sub-phase.
    pub fn set(&mut self, sub_phase: SubPhase, status: PhaseStatus) {
        self.statuses.insert(sub_phase, status);
        self.updated_at = Utc::now();
    }

    /// Returns true if every sub-phase succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        SubPhase::ALL
            .iter()
            .all(|s| self.status(*s) == PhaseStatus::Success)
    }

    /// Marks the run as finished.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Returns true if a run with `config_hash` should resume this state:
    /// the configuration is the same, a sub-phase has been recorded and no
    /// run of it finished.
    ///
    /// A run that crashed leaves its last sub-phases pending, so pending
    /// alone does not tell a finished run from an interrupted one.
    #[must_use]
    pub fn resumable_for(&self, config_hash: &str) -> bool {
        self.config_hash == config_hash
            && self.finished_at.is_none()
            && self.statuses.values().any(|s| *s != PhaseStatus::Pending)
    }

    /// Returns the first sub-phase that has not succeeded.
    #[must_use]
    pub fn first_unfinished(&self) -> Option<SubPhase> {
        SubPhase::ALL
            .iter()
            .copied()
            .find(|s| self.status(*s) != PhaseStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_pending() {
        let state = UpgradeState::new("abc");
        assert_eq!(state.statuses.len(), SubPhase::ALL.len());
        assert!(state.statuses.values().all(|s| *s == PhaseStatus::Pending));
        assert!(!state.is_complete());
        assert_eq!(state.first_unfinished(), Some(SubPhase::PreInfrastructure));
    }

    #[test]
    fn test_resume_rules() {
        let mut state = UpgradeState::new("abc");
        assert!(!state.resumable_for("abc"));
        state.set(SubPhase::PreInfrastructure, PhaseStatus::Success);
        state.set(SubPhase::Infrastructure, PhaseStatus::Failed);

        assert!(state.resumable_for("abc"));
        assert!(!state.resumable_for("other"));
        assert_eq!(state.first_unfinished(), Some(SubPhase::Infrastructure));

        for sub in SubPhase::ALL {
            state.set(*sub, PhaseStatus::Success);
        }
        assert!(state.is_complete());
        assert!(state.resumable_for("abc"));
        state.finish();
        assert!(!state.resumable_for("abc"));
    }

    #[test]
    fn test_interrupted_run_without_failure_is_resumable() {
        let mut state = UpgradeState::new("abc");
        state.set(SubPhase::PreInfrastructure, PhaseStatus::Success);
        state.set(SubPhase::Infrastructure, PhaseStatus::Success);

        assert!(state.resumable_for("abc"));
        assert_eq!(state.first_unfinished(), Some(SubPhase::PostInfrastructure));

        let json = serde_json::to_value(&state).expect("serialize");
        assert!(json.get("finished_at").is_none());
        let back: UpgradeState = serde_json::from_value(json).expect("deserialize");
        assert!(back.resumable_for("abc"));
    }

    #[test]
    fn test_serialized_keys_are_kebab_case() {
        let mut state = UpgradeState::new("abc");
        state.set(SubPhase::PostKubernetes, PhaseStatus::Failed);

        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(json["statuses"]["post-kubernetes"], "failed");

        let back: UpgradeState = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, state);
    }
}
