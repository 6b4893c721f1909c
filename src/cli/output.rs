//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::allocator::Constraint;
use crate::config::{Inventory, ValidationResult};
use crate::state::{Host, Service};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Per-service summary shown by `reconcile` and `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    /// Service id.
    pub id: i64,
    /// Stack-qualified service name.
    pub name: String,
    /// Lifecycle state.
    pub state: String,
    /// Desired unit count.
    pub scale: u32,
    /// Running instances.
    pub running: usize,
    /// Whether the service has converged.
    pub healthy: bool,
}

impl ServiceReport {
    /// Builds a report for a service.
    #[must_use]
    pub fn new(service: &Service, running: usize, healthy: bool) -> Self {
        Self {
            id: service.id,
            name: format!("{}/{}", service.stack_name, service.name),
            state: service.state.to_string(),
            scale: service.scale,
            running,
            healthy,
        }
    }
}

/// Service row for table display.
#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Service")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Running")]
    running: String,
    #[tabled(rename = "Health")]
    health: String,
}

/// Constraint row for table display.
#[derive(Tabled)]
struct ConstraintRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Hard")]
    hard: String,
}

/// Host row for table display.
#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Labels")]
    labels: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a validation result together with an inventory summary.
    #[must_use]
    pub fn format_validation(&self, inventory: &Inventory, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "hosts": inventory.hosts.len(),
                "services": inventory.services.len(),
                "instances": inventory.instances.len(),
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Inventory is valid\n", "ok".green())
                } else {
                    let mut output = format!("{} {} error(s):\n", "error".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                    output
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "warn".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nInventory summary:\n");
                let _ = writeln!(output, "   Hosts: {}", inventory.hosts.len());
                let _ = writeln!(output, "   Services: {}", inventory.services.len());
                let _ = writeln!(output, "   Instances: {}", inventory.instances.len());
                output
            }
        }
    }

    /// Formats extracted constraints.
    #[must_use]
    pub fn format_constraints(&self, constraints: &[Constraint]) -> String {
        match self.format {
            OutputFormat::Json => to_json(
                &constraints
                    .iter()
                    .map(|c| {
                        let def = c.definition();
                        serde_json::json!({
                            "kind": constraint_kind(c),
                            "op": def.op.to_string(),
                            "key": def.key,
                            "value": def.value,
                            "hard": !def.op.is_soft(),
                        })
                    })
                    .collect::<Vec<_>>(),
            ),
            OutputFormat::Text => {
                if constraints.is_empty() {
                    return String::from("No constraints.\n");
                }
                let rows: Vec<ConstraintRow> = constraints
                    .iter()
                    .enumerate()
                    .map(|(i, c)| ConstraintRow {
                        index: i + 1,
                        kind: constraint_kind(c).to_string(),
                        rule: c.to_string(),
                        hard: if c.definition().op.is_soft() {
                            "soft".dimmed().to_string()
                        } else {
                            "hard".bold().to_string()
                        },
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats hosts satisfying host affinity rules.
    #[must_use]
    pub fn format_hosts(&self, account_id: i64, hosts: &[Host]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "account_id": account_id,
                "hosts": hosts.iter().map(|h| h.id).collect::<Vec<_>>(),
            })),
            OutputFormat::Text => {
                if hosts.is_empty() {
                    return format!("No eligible hosts in account {account_id}.\n");
                }
                let rows: Vec<HostRow> = hosts
                    .iter()
                    .map(|h| {
                        let mut labels: Vec<String> = h.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                        labels.sort();
                        HostRow {
                            id: h.id,
                            name: h.name.clone(),
                            labels: truncate(&labels.join(","), 48),
                        }
                    })
                    .collect();
                format!(
                    "{} eligible host(s) in account {account_id}\n\n{}\n",
                    hosts.len(),
                    Table::new(rows)
                )
            }
        }
    }

    /// Formats per-service reports.
    #[must_use]
    pub fn format_services(&self, reports: &[ServiceReport]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&reports),
            OutputFormat::Text => {
                if reports.is_empty() {
                    return String::from("No services.\n");
                }
                let rows: Vec<ServiceRow> = reports
                    .iter()
                    .map(|r| ServiceRow {
                        id: r.id,
                        name: truncate(&r.name, 40),
                        state: r.state.clone(),
                        running: format!("{}/{}", r.running, r.scale),
                        health: if r.healthy {
                            "converged".green().to_string()
                        } else {
                            "reconciling".yellow().to_string()
                        },
                    })
                    .collect();

                let converged = reports.iter().filter(|r| r.healthy).count();
                format!(
                    "{}\n\n{converged}/{} service(s) converged\n",
                    Table::new(rows),
                    reports.len()
                )
            }
        }
    }
}

const fn constraint_kind(constraint: &Constraint) -> &'static str {
    match constraint {
        Constraint::HostAffinity(_) => "host_label",
        Constraint::ContainerAffinity(_) => "container",
        Constraint::ContainerLabelAffinity(_) => "container_label",
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::extract_constraints_from_env;
    use crate::labels::Labels;
    use crate::testing::{host_fixture, service_fixture};

    #[test]
    fn test_constraints_json_lists_each_rule() {
        let env: Labels = [(String::from("constraint:region==west"), String::new())].into_iter().collect();
        let constraints = extract_constraints_from_env(&env);

        let output = OutputFormatter::new(OutputFormat::Json).format_constraints(&constraints);
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("valid json");

        assert_eq!(parsed[0]["kind"], "host_label");
        assert_eq!(parsed[0]["key"], "region");
        assert_eq!(parsed[0]["value"], "west");
        assert_eq!(parsed[0]["hard"], true);
    }

    #[test]
    fn test_hosts_text_mentions_count() {
        let hosts = vec![host_fixture(1, &[("region", "west")])];
        let output = OutputFormatter::new(OutputFormat::Text).format_hosts(1, &hosts);
        assert!(output.contains("1 eligible host(s)"));
        assert!(output.contains("region=west"));
    }

    #[test]
    fn test_services_json_round_trips_report() {
        let report = ServiceReport::new(&service_fixture(1, "web"), 1, true);
        let output = OutputFormatter::new(OutputFormat::Json).format_services(&[report]);
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("valid json");

        assert_eq!(parsed[0]["name"], "foo/web");
        assert_eq!(parsed[0]["healthy"], true);
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
