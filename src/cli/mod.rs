//! CLI module for the corral reconciler.
//!
//! This module provides the command-line interface for validating an
//! inventory, inspecting placement constraints and running reconciliation
//! passes against a local state snapshot.

mod commands;
mod output;

pub use commands::{parse_env_args, parse_label_args, Cli, Commands, OutputFormat};
pub use output::{OutputFormatter, ServiceReport};
