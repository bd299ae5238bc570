//! Error types for the clusterforge reconciliation engine.
//!
//! The hierarchy mirrors the lifecycle of a run: configuration loading and
//! merging, rule evaluation, tool execution, state persistence, and the
//! phase state machine that wraps all of them with context.

use std::path::PathBuf;
use thiserror::Error;

use crate::planner::Violation;

/// The main error type for clusterforge.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration tree merge errors.
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Rules manifest errors.
    #[error("Rules error: {0}")]
    Rules(#[from] RulesError),

    /// One or more immutable or reducer rules were violated.
    #[error("{}", format_violations(.0))]
    Violations(Vec<Violation>),

    /// External tool execution errors.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// An error raised while executing a phase or sub-phase.
    #[error("{phase} failed: {source}")]
    Phase {
        /// Phase or sub-phase label.
        phase: String,
        /// Underlying error.
        #[source]
        source: Box<ForgeError>,
    },

    /// The operator rejected a confirmation prompt.
    #[error("Aborted by user: {reason}")]
    AbortedByUser {
        /// What the operator declined.
        reason: String,
    },

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// The stored configuration could not be compared with the current one.
    #[error("Stored configuration is unreadable: {message}")]
    StoredConfigUnreadable {
        /// Description of the problem.
        message: String,
    },

    /// The distribution version changed without upgrades being allowed.
    #[error("Distribution version changed from {from} to {to}; rerun with --upgrade to proceed")]
    UpgradeNotAllowed {
        /// Previously applied distribution version.
        from: String,
        /// Requested distribution version.
        to: String,
    },

    /// An unknown phase name was requested.
    #[error("Unknown phase: {name}")]
    UnknownPhase {
        /// The unknown phase name.
        name: String,
    },
}

/// Errors raised while navigating or merging configuration trees.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    /// A path segment does not exist.
    #[error("key '{key}' not found while resolving '{path}'")]
    KeyNotFound {
        /// Full selector being resolved.
        path: String,
        /// Missing segment.
        key: String,
    },

    /// A path segment exists but is not a map.
    #[error("key '{key}' is not a map while resolving '{path}'")]
    NotAMap {
        /// Full selector being resolved.
        path: String,
        /// Offending segment.
        key: String,
    },
}

/// Rules manifest errors.
#[derive(Debug, Error)]
pub enum RulesError {
    /// The rules file exists but cannot be parsed.
    #[error("Malformed rules file {path}: {message}")]
    Malformed {
        /// Path to the rules file.
        path: PathBuf,
        /// Parse error description.
        message: String,
    },

    /// The rules file could not be read.
    #[error("Cannot read rules file {path}: {message}")]
    Unreadable {
        /// Path to the rules file.
        path: PathBuf,
        /// IO error description.
        message: String,
    },

    /// A rule path pattern is invalid.
    #[error("Invalid rule path '{pattern}'")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
    },
}

/// External tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The binary could not be started.
    #[error("Failed to start {binary}: {message}")]
    SpawnFailed {
        /// Binary name or path.
        binary: String,
        /// Description of the spawn failure.
        message: String,
    },

    /// The command exited unsuccessfully.
    #[error("Command failed: {command} (exit code {code:?})\n{output}")]
    CommandFailed {
        /// Full command line.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Tail of the combined output.
        output: String,
    },

    /// The command output could not be interpreted.
    #[error("Unexpected output from {binary}: {message}")]
    InvalidOutput {
        /// Binary name or path.
        binary: String,
        /// Description of the problem.
        message: String,
    },

    /// One or more processes could not be signalled to stop.
    #[error("Failed to stop {runner}: {message}")]
    StopFailed {
        /// Runner name.
        runner: String,
        /// Description of the failure.
        message: String,
    },

    /// The target cluster API could not be reached.
    #[error("Cluster is unreachable: {message}")]
    ClusterUnreachable {
        /// Description of the failure.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local backend IO failure.
    #[error("Local state backend error: {message}")]
    LocalError {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Result type alias for clusterforge operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

fn format_violations(violations: &[Violation]) -> String {
    let mut out = format!("{} configuration rule violation(s):", violations.len());
    for violation in violations {
        out.push_str("\n  - ");
        out.push_str(&violation.to_string());
    }
    out
}

impl ForgeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps the error with the label of the phase it happened in.
    #[must_use]
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            source: Box::new(self),
        }
    }

    /// Returns true if this error (or the error it wraps) is a user abort.
    #[must_use]
    pub fn is_aborted_by_user(&self) -> bool {
        match self {
            Self::AbortedByUser { .. } => true,
            Self::Phase { source, .. } => source.is_aborted_by_user(),
            _ => false,
        }
    }

    /// Returns the rule violations carried by this error, if any.
    #[must_use]
    pub fn violations(&self) -> Option<&[Violation]> {
        match self {
            Self::Violations(v) => Some(v),
            Self::Phase { source, .. } => source.violations(),
            _ => None,
        }
    }

    /// Returns true if this error reports an unreachable cluster.
    #[must_use]
    pub fn is_cluster_unreachable(&self) -> bool {
        match self {
            Self::Tool(ToolError::ClusterUnreachable { .. }) => true,
            Self::Phase { source, .. } => source.is_cluster_unreachable(),
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a parse error without location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
