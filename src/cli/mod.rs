//! CLI module for the clusterforge engine.
//!
//! This module provides the command-line interface for reconciling
//! clusters and inspecting their state.

mod commands;
mod output;

pub use commands::{Cli, Commands, DistroArgs, OutputFormat, StateCommands};
pub use output::OutputFormatter;
