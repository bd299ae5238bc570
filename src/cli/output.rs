//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::{Value, json};
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ClusterConfig, ValidationResult};
use crate::planner::{ChangeKind, Changelog, RuleReport, Violation, ViolationKind};
use crate::reconciler::ReconciliationResult;
use crate::state::{LockInfo, PhaseStatus, UpgradeState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Changelog row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Change")]
    kind: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
}

/// Violation row for table display.
#[derive(Tabled)]
struct ViolationRow {
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Rule")]
    kind: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Sub-phase row for table display.
#[derive(Tabled)]
struct SubPhaseRow {
    #[tabled(rename = "Sub-phase")]
    sub_phase: String,
    #[tabled(rename = "Status")]
    status: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the changes since the last run and the rules they break.
    #[must_use]
    pub fn format_diff(&self, changelog: &Changelog, report: &RuleReport) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({
                "changes": changelog,
                "violations": report.violations,
                "activeReducers": report.active_reducers,
            })),
            OutputFormat::Text => {
                if changelog.is_empty() {
                    return format!("{} No changes since the last successful run.\n", "✓".green());
                }

                let rows: Vec<ChangeRow> = changelog
                    .iter()
                    .map(|c| ChangeRow {
                        kind: Self::format_change_kind(c.kind),
                        path: c.dotted_path(),
                        from: Self::truncate(&display_value(&c.from), 30),
                        to: Self::truncate(&display_value(&c.to), 30),
                    })
                    .collect();

                let mut output = format!("\nConfiguration changes ({}):\n", changelog.len());
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                if !report.violations.is_empty() {
                    output.push_str(&self.format_violations(&report.violations));
                }
                if !report.active_reducers.is_empty() {
                    let _ = writeln!(output, "\nMigrations to run:");
                    for reducer in &report.active_reducers {
                        let _ = writeln!(
                            output,
                            "   - {} ({}) {}: {} -> {}",
                            reducer.key.cyan(),
                            reducer.lifecycle,
                            reducer.path,
                            display_value(&reducer.from),
                            display_value(&reducer.to)
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats rule violations.
    #[must_use]
    pub fn format_violations(&self, violations: &[Violation]) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({ "violations": violations })),
            OutputFormat::Text => {
                let rows: Vec<ViolationRow> = violations
                    .iter()
                    .map(|v| ViolationRow {
                        phase: v.phase.to_string(),
                        kind: match v.kind {
                            ViolationKind::Immutable => "immutable".red().to_string(),
                            ViolationKind::ReducerUnsupported => "unsupported".red().to_string(),
                        },
                        path: v.path.clone(),
                        change: format!(
                            "{} -> {}",
                            Self::truncate(&display_value(&v.from), 20),
                            Self::truncate(&display_value(&v.to), 20)
                        ),
                        reason: Self::truncate(&v.reason, 40),
                    })
                    .collect();

                let mut output = format!(
                    "\n{} {} change(s) are not allowed:\n",
                    "✗".red(),
                    violations.len()
                );
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &ClusterConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({
                "cluster": config.name(),
                "kind": config.kind(),
                "distributionVersion": config.distribution_version(),
                "valid": result.errors.is_empty(),
                "result": result,
            })),
            OutputFormat::Text => {
                let mut output = if result.errors.is_empty() {
                    format!("{} Configuration is valid!\n", "✓".green())
                } else {
                    let mut out = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(out, "   - {}: {}", error.field, error.message);
                    }
                    out
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(output, "\nConfiguration summary:\n");
                let _ = writeln!(output, "   Cluster: {}", config.name());
                let _ = writeln!(output, "   Kind: {}", config.kind());
                let _ = writeln!(output, "   Distribution: {}", config.distribution_version());
                for section in ["infrastructure", "kubernetes", "distribution"] {
                    let declared = if config.has_section(section) { "yes" } else { "no" };
                    let _ = writeln!(output, "   {section}: {declared}");
                }
                output
            }
        }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => pretty(result),
            OutputFormat::Text => {
                let title = if result.dry_run {
                    format!("{} Dry run complete, nothing was changed", "✓".green())
                } else {
                    format!("{} Cluster reconciled", "✓".green())
                };

                let mut output = format!("{title}\n\n");
                if result.first_run {
                    let _ = writeln!(output, "   First run for this cluster");
                } else {
                    let _ = writeln!(output, "   Changes applied: {}", result.changes);
                }
                if let Some((from, to)) = &result.upgrade {
                    let _ = writeln!(output, "   Distribution upgraded: {from} -> {}", to.cyan());
                }
                if result.resumed {
                    let _ = writeln!(output, "   Resumed an interrupted run");
                }
                let executed: Vec<String> = result.executed.iter().map(ToString::to_string).collect();
                let _ = writeln!(output, "   Ran: {}", list_or_none(&executed));
                let skipped: Vec<String> = result.skipped.iter().map(ToString::to_string).collect();
                let _ = writeln!(output, "   Skipped: {}", list_or_none(&skipped).dimmed());
                output
            }
        }
    }

    /// Formats the stored state of a cluster.
    #[must_use]
    pub fn format_state(
        &self,
        backend: &str,
        state: Option<&UpgradeState>,
        lock: Option<&LockInfo>,
    ) -> String {
        match self.format {
            OutputFormat::Json => pretty(&json!({
                "backend": backend,
                "upgradeState": state,
                "lock": lock,
            })),
            OutputFormat::Text => {
                let mut output = format!("\nState backend: {backend}\n");

                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = writeln!(
                            output,
                            "   {} Locked by {} since {} ({}, expires in {}s)",
                            "⚠".yellow(),
                            lock.holder,
                            lock.acquired_at.format("%Y-%m-%d %H:%M"),
                            lock.operation,
                            lock.remaining_secs()
                        );
                    }
                    Some(lock) => {
                        let _ = writeln!(output, "   Expired lock left by {}", lock.holder);
                    }
                    None => {
                        let _ = writeln!(output, "   Not locked");
                    }
                }

                let Some(state) = state else {
                    output.push_str("   No run recorded.\n");
                    return output;
                };

                let _ = writeln!(output, "   Config hash: {}", Self::truncate(&state.config_hash, 12));
                let _ = writeln!(output, "   Started: {}", state.started_at.format("%Y-%m-%d %H:%M"));
                let _ = writeln!(output, "   Updated: {}\n", state.updated_at.format("%Y-%m-%d %H:%M"));

                let rows: Vec<SubPhaseRow> = state
                    .statuses
                    .iter()
                    .map(|(sub, status)| SubPhaseRow {
                        sub_phase: sub.to_string(),
                        status: Self::format_status(*status),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats a change kind with color.
    fn format_change_kind(kind: ChangeKind) -> String {
        match kind {
            ChangeKind::Create => "+create".green().to_string(),
            ChangeKind::Update => "~update".yellow().to_string(),
            ChangeKind::Delete => "-delete".red().to_string(),
        }
    }

    /// Formats a sub-phase status with color.
    fn format_status(status: PhaseStatus) -> String {
        match status {
            PhaseStatus::Success => "success".green().to_string(),
            PhaseStatus::Failed => "failed".red().to_string(),
            PhaseStatus::Pending => "pending".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::from("-"),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        String::from("none")
    } else {
        items.join(", ")
    }
}
