//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use rowgate_core::{DecisionTrace, Policy, PolicyType, Row, Value};
use serde_json::json;

use crate::commands::{Explanation, ValidationReport};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format the rows visible to a principal.
    fn format_rows(&self, rows: &[Row]) -> String;

    /// Format a bundle validation report.
    fn format_validation(&self, report: &ValidationReport) -> String;

    /// Format a decision explanation.
    fn format_explanation(&self, explanation: &Explanation) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_rows(&self, rows: &[Row]) -> String {
        let mut columns: Vec<&str> = Vec::new();
        for row in rows {
            for (name, _) in row.iter() {
                if !columns.contains(&name.as_str()) {
                    columns.push(name);
                }
            }
        }

        let mut table = Table::new();
        table.set_header(columns.iter().map(Cell::new));
        for row in rows {
            table.add_row(
                columns
                    .iter()
                    .map(|c| Cell::new(row.get(c).map(format_value).unwrap_or_default())),
            );
        }
        format!("{}\n{} row(s)", table, rows.len())
    }

    fn format_validation(&self, report: &ValidationReport) -> String {
        let mut output = format!(
            "{} policies on {} collection(s), snapshot v{}",
            report.policies, report.collections, report.version
        );
        if report.lockouts.is_empty() {
            output.push_str("\nno lockouts");
            return output;
        }

        let mut table = Table::new();
        table.set_header(vec![Cell::new("collection"), Cell::new("locked out")]);
        for lockout in &report.lockouts {
            table.add_row(vec![
                Cell::new(&lockout.collection),
                Cell::new(lockout.command),
            ]);
        }
        format!("{}\n{}", output, table)
    }

    fn format_explanation(&self, explanation: &Explanation) -> String {
        let mut output = format!(
            "{} on '{}' as {} (mode {})\n",
            explanation.command, explanation.collection, explanation.role, explanation.mode
        );
        if !explanation.enforced {
            output.push_str("enforcement skipped for this principal\n");
        }

        let mut table = Table::new();
        table.set_header(vec![
            Cell::new("policy"),
            Cell::new("type"),
            Cell::new("command"),
            Cell::new("roles"),
            Cell::new("using"),
            Cell::new("check"),
        ]);
        for policy in &explanation.policies {
            table.add_row(vec![
                Cell::new(&policy.name),
                Cell::new(policy_type(policy.policy_type)),
                Cell::new(policy.command),
                Cell::new(roles(policy)),
                Cell::new(policy.using.as_ref().map(ToString::to_string).unwrap_or_default()),
                Cell::new(policy.check.as_ref().map(ToString::to_string).unwrap_or_default()),
            ]);
        }
        output.push_str(&table.to_string());

        output.push_str(&format!("\npushdown: {}", explanation.pushdown.predicate));
        let columns: Vec<&str> = explanation
            .pushdown
            .columns
            .iter()
            .map(String::as_str)
            .collect();
        output.push_str(&format!("\nindex hints: {}", columns.join(", ")));

        for trace in &explanation.traces {
            output.push_str(&format!("\n{}", trace));
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_rows(&self, rows: &[Row]) -> String {
        serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_validation(&self, report: &ValidationReport) -> String {
        let lockouts: Vec<_> = report
            .lockouts
            .iter()
            .map(|l| json!({ "collection": l.collection, "command": l.command.as_str() }))
            .collect();
        json!({
            "policies": report.policies,
            "collections": report.collections,
            "version": report.version,
            "lockouts": lockouts,
        })
        .to_string()
    }

    fn format_explanation(&self, explanation: &Explanation) -> String {
        let policies: Vec<_> = explanation
            .policies
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "type": policy_type(p.policy_type),
                    "command": p.command.as_str(),
                    "roles": p.roles,
                    "using": p.using.as_ref().map(ToString::to_string),
                    "check": p.check.as_ref().map(ToString::to_string),
                })
            })
            .collect();
        let traces: Vec<_> = explanation.traces.iter().map(trace_to_json).collect();

        json!({
            "collection": explanation.collection,
            "command": explanation.command.as_str(),
            "role": explanation.role,
            "mode": explanation.mode.as_str(),
            "enforced": explanation.enforced,
            "policies": policies,
            "pushdown": {
                "predicate": explanation.pushdown.predicate.to_string(),
                "columns": explanation.pushdown.columns,
                "policies": explanation.pushdown.policies,
            },
            "traces": traces,
        })
        .to_string()
    }

    fn format_message(&self, message: &str) -> String {
        json!({ "message": message }).to_string()
    }
}

fn trace_to_json(trace: &DecisionTrace) -> serde_json::Value {
    let policies: Vec<_> = trace
        .policies
        .iter()
        .map(|p| {
            json!({
                "policy": p.policy,
                "type": policy_type(p.policy_type),
                "outcome": p.outcome.to_string(),
            })
        })
        .collect();
    json!({
        "phase": trace.phase.clause(),
        "version": trace.version,
        "lockout": trace.lockout,
        "permissive": trace.permissive,
        "restrictive": trace.restrictive,
        "allowed": trace.allowed,
        "policies": policies,
    })
}

fn policy_type(policy_type: PolicyType) -> &'static str {
    match policy_type {
        PolicyType::Permissive => "permissive",
        PolicyType::Restrictive => "restrictive",
    }
}

fn roles(policy: &Policy) -> String {
    if policy.roles.is_empty() {
        return "*".to_string();
    }
    let roles: Vec<&str> = policy.roles.iter().map(String::as_str).collect();
    roles.join(", ")
}

/// Format a Value as a table cell.
fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgate_core::{Command, LockoutWarning};

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&Value::Null), "NULL");
        assert_eq!(format_value(&Value::from("u1")), "u1");
        assert_eq!(format_value(&Value::Int(7)), "7");
    }

    #[test]
    fn test_table_rows_union_columns() {
        let rows = vec![
            Row::new().with("id", 1).with("owner_id", "u1"),
            Row::new().with("id", 2).with("team_id", "red"),
        ];
        let output = TableFormatter.format_rows(&rows);
        assert!(output.contains("owner_id"));
        assert!(output.contains("team_id"));
        assert!(output.ends_with("2 row(s)"));
    }

    #[test]
    fn test_json_rows() {
        let rows = vec![Row::new().with("owner_id", "u1")];
        let parsed: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_rows(&rows)).unwrap();
        assert_eq!(parsed, json!([{ "owner_id": "u1" }]));
    }

    #[test]
    fn test_validation_report() {
        let report = ValidationReport {
            policies: 1,
            collections: 1,
            version: 3,
            lockouts: vec![LockoutWarning {
                collection: "docs".to_string(),
                command: Command::Delete,
            }],
        };
        assert!(TableFormatter.format_validation(&report).contains("DELETE"));

        let parsed: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_validation(&report)).unwrap();
        assert_eq!(parsed["lockouts"][0]["command"], "DELETE");
        assert_eq!(parsed["version"], 3);
    }
}
