//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};
use crate::labels::Labels;

/// Corral - affinity-aware service deployment reconciler.
#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the inventory file.
    #[arg(short, long, global = true, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the state snapshot (defaults to `.corral/state.json` next to
    /// the inventory).
    #[arg(short, long, global = true, env = "CORRAL_STATE")]
    pub state: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the inventory.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the placement constraints extracted from labels and environment
    /// keys.
    Constraints {
        /// Scheduler label, as KEY=VALUE (repeatable).
        #[arg(short, long = "label", value_name = "KEY=VALUE")]
        labels: Vec<String>,

        /// Environment key such as `constraint:region==west` (repeatable).
        #[arg(short, long = "env", value_name = "KEY")]
        env: Vec<String>,
    },

    /// List the active hosts satisfying host-label affinity rules.
    Hosts {
        /// Account whose hosts are considered.
        #[arg(short, long, default_value = "1")]
        account: i64,

        /// Affinity label, as KEY=VALUE (repeatable).
        #[arg(short, long = "label", value_name = "KEY=VALUE")]
        labels: Vec<String>,
    },

    /// Reconcile active services and save the resulting state.
    Reconcile {
        /// Only reconcile the named service.
        #[arg(long)]
        service: Option<String>,
    },

    /// Show whether each service has converged.
    Status,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
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

/// Parses repeated `KEY=VALUE` arguments into a label map.
///
/// The value may contain `=`; only the first one splits.
///
/// # Errors
///
/// Returns an error if an argument has no `=` or an empty key.
pub fn parse_label_args(args: &[String]) -> Result<Labels> {
    let mut labels = Labels::new();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                labels.insert(key.trim().to_string(), value.to_string());
            }
            _ => {
                return Err(ConfigError::validation(format!("expected KEY=VALUE, got '{arg}'"), "label").into());
            }
        }
    }
    Ok(labels)
}

/// Turns repeated environment keys into an environment map with empty
/// values; only the keys carry constraints.
#[must_use]
pub fn parse_env_args(args: &[String]) -> Labels {
    args.iter().map(|key| (key.clone(), String::new())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reconcile_with_service() {
        let cli = Cli::try_parse_from(["corral", "--output", "json", "reconcile", "--service", "web"])
            .expect("should parse");

        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Reconcile { service: Some(ref s) } if s == "web"));
    }

    #[test]
    fn test_parse_constraints_repeats() {
        let cli = Cli::try_parse_from([
            "corral",
            "constraints",
            "--label",
            "io.rancher.scheduler.affinity:host_label=region=west",
            "--env",
            "affinity:container!=db",
            "--env",
            "constraint:disk==ssd",
        ])
        .expect("should parse");

        let Commands::Constraints { labels, env } = cli.command else {
            panic!("expected constraints command");
        };
        assert_eq!(labels.len(), 1);
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_label_args_split_on_first_equals() {
        let labels = parse_label_args(&[String::from("io.rancher.scheduler.affinity:host_label=region=west")])
            .expect("should parse");

        assert_eq!(
            labels.get("io.rancher.scheduler.affinity:host_label").map(String::as_str),
            Some("region=west")
        );
    }

    #[test]
    fn test_label_args_reject_missing_equals() {
        assert!(parse_label_args(&[String::from("region")]).is_err());
        assert!(parse_label_args(&[String::from("=west")]).is_err());
    }
}
