//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ENV_DISTRO_LOCATION;
use crate::phase::{ForceFeature, Phase, SubPhase};

/// Clusterforge - cluster lifecycle reconciliation.
#[derive(Parser, Debug)]
#[command(name = "clusterforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CLUSTERFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by commands that need the distribution.
#[derive(Args, Debug, Clone)]
pub struct DistroArgs {
    /// Directory holding the distribution defaults, rules and templates.
    #[arg(long, env = ENV_DISTRO_LOCATION, default_value = "distribution")]
    pub distro_location: PathBuf,

    /// Directory for state and working files (defaults to the
    /// configuration's directory).
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the cluster configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the changes since the last successful run and the rules they
    /// break.
    Diff {
        /// Distribution options.
        #[command(flatten)]
        distro: DistroArgs,
    },

    /// Reconcile the cluster with its configuration.
    Apply {
        /// Distribution options.
        #[command(flatten)]
        distro: DistroArgs,

        /// Run only this phase.
        #[arg(long, conflicts_with = "skip_phase")]
        phase: Option<Phase>,

        /// Start from this sub-phase (e.g. `post-kubernetes`).
        #[arg(long)]
        start_from: Option<SubPhase>,

        /// Skip a phase (repeatable).
        #[arg(long)]
        skip_phase: Vec<Phase>,

        /// Plan only, change nothing.
        #[arg(long)]
        dry_run: bool,

        /// Allow a distribution version change.
        #[arg(long)]
        upgrade: bool,

        /// Bypass a safety check (repeatable).
        #[arg(long, value_enum)]
        force: Vec<ForceFeature>,

        /// Use this kubeconfig instead of the generated one.
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,

        /// Prefer tool binaries found in this directory.
        #[arg(long)]
        bin_path: Option<PathBuf>,
    },

    /// Manage the cluster state.
    State {
        /// Distribution options.
        #[command(flatten)]
        distro: DistroArgs,

        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the stored state.
    Show,

    /// Unlock the state.
    Unlock {
        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "clusterforge",
            "apply",
            "--start-from",
            "post-kubernetes",
            "--skip-phase",
            "infrastructure",
            "--force",
            "migrations",
            "--dry-run",
        ])
        .expect("valid arguments");

        let Commands::Apply {
            start_from,
            skip_phase,
            force,
            dry_run,
            ..
        } = cli.command
        else {
            panic!("expected apply");
        };
        assert_eq!(start_from, Some(SubPhase::PostKubernetes));
        assert_eq!(skip_phase, vec![Phase::Infrastructure]);
        assert_eq!(force, vec![ForceFeature::Migrations]);
        assert!(dry_run);
    }

    #[test]
    fn test_phase_conflicts_with_skip() {
        assert!(
            Cli::try_parse_from([
                "clusterforge",
                "apply",
                "--phase",
                "distribution",
                "--skip-phase",
                "kubernetes",
            ])
            .is_err()
        );
    }
}
