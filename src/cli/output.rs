//! Output formatting for CLI commands.
//!
//! This module renders plans, runs, records and leases either as tables for
//! operators or as JSON for scripts.

use chrono::Utc;
use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{PilotConfig, ValidationResult};
use crate::planner::{Action, Plan};
use crate::reconciler::{DriftReport, DriftState, Outcome, ReconciliationRun, RunStatus};
use crate::resource::ConfigHasher;
use crate::state::{AppliedRecord, Lease, RecordStatus};
use crate::trigger::RunSummary;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// Applied record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
    #[tabled(rename = "Gen")]
    generation: u64,
    #[tabled(rename = "Last applied")]
    last_applied: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
}

/// Run history row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Applied")]
    applied: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Skipped")]
    skipped: usize,
    #[tabled(rename = "Plan")]
    plan_id: String,
}

/// Drift row for table display.
#[derive(Tabled)]
struct DriftRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Live state")]
    state: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - {} is up to date.\n",
                "✓".green(),
                plan.project_id()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for {}", plan.project_id().bold());
        let _ = write!(output, "   Plan ID: {}\n\n", plan.plan_id());

        let rows: Vec<PlanRow> = plan
            .operations()
            .iter()
            .enumerate()
            .map(|(i, op)| PlanRow {
                index: i + 1,
                action: Self::format_action(op.action),
                kind: op.kind().to_string(),
                identity: op.identity().to_string(),
                checksum: if op.action == Action::Delete {
                    String::from("-")
                } else {
                    ConfigHasher::short_hash(op.descriptor.checksum()).to_string()
                },
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.delete.to_string().red(),
            summary.unchanged
        );

        output
    }

    /// Formats the result of a deploy.
    #[must_use]
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Json => to_json(summary),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} {} at {}\n",
                    Self::format_run_status(summary.status),
                    summary.project_id.bold(),
                    ConfigHasher::short_hash(&summary.commit_sha)
                );

                if let Some(reason) = &summary.reason {
                    let _ = writeln!(output, "   Reason: {reason}");
                }
                if let Some(ms) = summary.duration_ms {
                    let _ = writeln!(output, "   Duration: {}.{}s", ms / 1000, (ms % 1000) / 100);
                }

                if !summary.operations.is_empty() {
                    output.push('\n');
                    let rows: Vec<OutcomeRow> = summary
                        .operations
                        .iter()
                        .map(|op| OutcomeRow {
                            action: Self::format_action(op.action),
                            kind: op.kind.to_string(),
                            identity: op.identity.clone(),
                            outcome: Self::format_outcome(&op.outcome),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                output
            }
        }
    }

    /// Formats the applied records of a project.
    #[must_use]
    pub fn format_records(&self, project: &str, records: &[AppliedRecord]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "project_id": project,
                "records": records,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nProject: {}\n\n", project.bold());

                if records.is_empty() {
                    output.push_str("   Nothing has been applied yet.\n");
                    return output;
                }

                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|r| RecordRow {
                        kind: r.kind.to_string(),
                        identity: r.identity.clone(),
                        status: Self::format_record_status(r.status),
                        checksum: r
                            .checksum
                            .as_deref()
                            .map_or_else(|| String::from("-"), |c| ConfigHasher::short_hash(c).to_string()),
                        generation: r.generation,
                        last_applied: r
                            .last_applied_at
                            .map_or_else(|| String::from("never"), |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
                        provider_id: truncate(r.provider_id.as_deref().unwrap_or("-"), 32),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let applied = records.iter().filter(|r| r.status == RecordStatus::Applied).count();
                let _ = write!(output, "\n{applied}/{} resources applied\n", records.len());

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.entries.is_empty() {
                    return format!("{} No applied resources to inspect.\n", "✓".green());
                }

                let rows: Vec<DriftRow> = report
                    .entries
                    .iter()
                    .map(|e| DriftRow {
                        kind: e.key.kind.to_string(),
                        identity: e.key.identity.clone(),
                        state: Self::format_drift_state(&e.state),
                    })
                    .collect();

                let mut output = format!("\nDrift for {}\n\n", report.project_id.bold());
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let missing = report.entries.iter().filter(|e| e.state == DriftState::Missing).count();
                let unreachable = report.unreachable().count();
                if report.has_drift() {
                    let _ = write!(output, "\n{} {missing} resource(s) missing on the provider side.\n", "⚠".yellow());
                } else {
                    let _ = write!(output, "\n{} No drift detected.\n", "✓".green());
                }
                if unreachable > 0 {
                    let _ = writeln!(output, "{} {unreachable} resource(s) could not be inspected.", "⚠".yellow());
                }

                output
            }
        }
    }

    /// Formats recent runs, newest first.
    #[must_use]
    pub fn format_history(&self, project: &str, runs: &[ReconciliationRun]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "project_id": project,
                "runs": runs,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nRecent runs for {}\n\n", project.bold());

                if runs.is_empty() {
                    output.push_str("   No runs recorded.\n");
                    return output;
                }

                let rows: Vec<HistoryRow> = runs
                    .iter()
                    .map(|run| HistoryRow {
                        started: run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        status: Self::format_run_status(run.status),
                        applied: run.count("applied"),
                        failed: run.count("failed"),
                        skipped: run.count("skipped"),
                        plan_id: truncate(&run.plan_id.to_string(), 8),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                output
            }
        }
    }

    /// Formats the lease of a project.
    #[must_use]
    pub fn format_lease(&self, project: &str, lease: Option<&Lease>) -> String {
        let now = Utc::now();
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "project_id": project,
                "lease": lease,
                "expired": lease.map(|lease| lease.is_expired_at(now)),
            })),
            OutputFormat::Text => match lease {
                None => format!("{} {project} is not leased.\n", "✓".green()),
                Some(lease) if lease.is_expired_at(now) => format!(
                    "{} Lease on {project} held by {} expired at {} and can be reclaimed.\n",
                    "⚠".yellow(),
                    lease.holder,
                    lease.expires_at.to_rfc3339()
                ),
                Some(lease) => {
                    let mut output = format!("{} {project} is leased.\n\n", "●".yellow());
                    let _ = writeln!(output, "   Holder: {}", lease.holder);
                    let _ = writeln!(output, "   Lease ID: {}", lease.lease_id);
                    let _ = writeln!(output, "   Acquired: {}", lease.acquired_at.to_rfc3339());
                    let _ = writeln!(output, "   Expires in: {}s", lease.remaining_secs_at(now));
                    output
                }
            },
        }
    }

    /// Formats the outcome of a forced lease release.
    #[must_use]
    pub fn format_lease_release(&self, project: &str, released: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "project_id": project,
                "released": released,
            })),
            OutputFormat::Text if released => format!("{} Lease on {project} released.\n", "✓".green()),
            OutputFormat::Text => format!("{project} had no lease to release.\n"),
        }
    }

    /// Formats a validation result with a short configuration summary.
    #[must_use]
    pub fn format_validation(&self, config: &PilotConfig, result: &ValidationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "projects": config.projects.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    format!("{} Configuration has {} error(s):\n", "✗".red(), result.error_count())
                };

                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }

                if result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(output, "\nState backend: {:?}\n", config.state.backend);
                let _ = writeln!(output, "Provisioning gateway: {}", config.provider.base_url);
                for project in &config.projects {
                    let _ = writeln!(
                        output,
                        "   {} ({}): app {}, {} secret(s), {} topic(s), {} domain(s)",
                        project.id,
                        project.region,
                        project.app.name,
                        project.secrets.len(),
                        project.topics.len(),
                        project.domains.len()
                    );
                }

                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            Action::Create => label.green().to_string(),
            Action::Update => label.yellow().to_string(),
            Action::Delete => label.red().to_string(),
            Action::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats an outcome with color.
    fn format_outcome(outcome: &Outcome) -> String {
        let text = truncate(&outcome.to_string(), 60);
        match outcome {
            Outcome::Applied { .. } => text.green().to_string(),
            Outcome::Unchanged => text.dimmed().to_string(),
            Outcome::Failed { .. } => text.red().to_string(),
            Outcome::Skipped { .. } => text.yellow().to_string(),
        }
    }

    fn format_run_status(status: RunStatus) -> String {
        match status {
            RunStatus::Succeeded => format!("{} succeeded", "✓".green()),
            RunStatus::PartiallyFailed => format!("{} partially failed", "⚠".yellow()),
            RunStatus::Failed => format!("{} failed", "✗".red()),
            RunStatus::Rejected => format!("{} rejected", "✗".red()),
        }
    }

    fn format_record_status(status: RecordStatus) -> String {
        match status {
            RecordStatus::Applied => "applied".green().to_string(),
            RecordStatus::Pending => "pending".yellow().to_string(),
            RecordStatus::Failed => "failed".red().to_string(),
        }
    }

    fn format_drift_state(state: &DriftState) -> String {
        match state {
            DriftState::Present { .. } => state.to_string().green().to_string(),
            DriftState::Missing => "missing".red().to_string(),
            DriftState::Unreachable { .. } => truncate(&state.to_string(), 60).yellow().to_string(),
        }
    }

    /// Returns the configured output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    plan_id: String,
    project_id: String,
    created_at: String,
    summary: crate::planner::PlanSummary,
    operations: Vec<OperationJson>,
}

#[derive(serde::Serialize)]
struct OperationJson {
    action: Action,
    kind: String,
    identity: String,
    checksum: Option<String>,
    previous_checksum: Option<String>,
    depends_on: Vec<String>,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            plan_id: plan.plan_id().to_string(),
            project_id: plan.project_id().to_string(),
            created_at: plan.created_at().to_rfc3339(),
            summary: plan.summary(),
            operations: plan
                .operations()
                .iter()
                .map(|op| OperationJson {
                    action: op.action,
                    kind: op.kind().to_string(),
                    identity: op.identity().to_string(),
                    checksum: (op.action != Action::Delete).then(|| op.descriptor.checksum().to_string()),
                    previous_checksum: op.previous_checksum.clone(),
                    depends_on: op.depends_on.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        }
    }
}
