//! Terminal rendering for run, preflight, validation and status output

use crate::orchestrator::{RunOutcome, RunReport};
use crate::preflight::PreflightReport;
use crate::state::{PipelineState, StatusCounts, UnitStatus};
use crate::validate::ValidationReport;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn status_marker(status: UnitStatus) -> String {
    match status {
        UnitStatus::Done => "done".green().to_string(),
        UnitStatus::Failed => "failed".red().to_string(),
        UnitStatus::InProgress => "in_progress".yellow().to_string(),
        UnitStatus::Pending => "pending".dimmed().to_string(),
    }
}

fn outcome_line(report: &RunReport) -> String {
    match report.outcome {
        RunOutcome::Completed if report.failed.is_empty() => "✓ Completed".green().bold().to_string(),
        RunOutcome::Completed => "✗ Completed with failures".yellow().bold().to_string(),
        RunOutcome::StoppedByRequest => "■ Stopped by request".yellow().bold().to_string(),
        RunOutcome::Aborted => "✗ Aborted".red().bold().to_string(),
        RunOutcome::Terminated => "✗ Terminated".red().bold().to_string(),
    }
}

fn counts_line(counts: &StatusCounts) -> String {
    format!(
        "{} done, {} failed, {} in progress, {} pending ({} total)",
        counts.done,
        counts.failed,
        counts.in_progress,
        counts.pending,
        counts.total()
    )
}

pub fn print_run_report(report: &RunReport) {
    println!();
    println!("{}", outcome_line(report));
    if let Some(reason) = &report.abort_reason {
        println!("  Reason: {}", reason.red());
    }
    println!();

    let mut table = new_table();
    table.set_header(vec!["Result", "Units"]);
    table.add_row(vec!["Done this run".to_string(), report.processed.len().to_string()]);
    table.add_row(vec!["Failed this run".to_string(), report.failed.len().to_string()]);
    table.add_row(vec!["Skipped (already done)".to_string(), report.skipped.len().to_string()]);
    table.add_row(vec!["Not started".to_string(), report.remaining.len().to_string()]);
    if let Some(key) = &report.interrupted {
        table.add_row(vec!["Interrupted".to_string(), key.clone()]);
    }
    println!("{}", table);

    if !report.failed.is_empty() {
        let mut failures = new_table();
        failures.set_header(vec!["Unit", "Error"]);
        for f in &report.failed {
            failures.add_row(vec![f.key.clone(), f.summary.clone()]);
        }
        println!();
        println!("{}", "Failed units:".red().bold());
        println!("{}", failures);
    }

    if report.dry_run {
        if !report.previews.is_empty() {
            let mut previews = new_table();
            previews.set_header(vec!["Unit", "Would upload to", "Rows", "Size", "SHA-256"]);
            for p in &report.previews {
                previews.add_row(vec![
                    p.key.clone(),
                    p.location.clone(),
                    p.rows.to_string(),
                    format_bytes(p.bytes),
                    p.sha256.chars().take(16).collect(),
                ]);
            }
            println!();
            println!("{}", "Dry run preview (nothing uploaded or recorded):".cyan().bold());
            println!("{}", previews);
        }
    } else {
        println!();
        println!("State: {}", counts_line(&report.totals));
    }
}

pub fn print_preflight(report: &PreflightReport) {
    for check in &report.checks {
        let marker = if check.passed { "✓".green() } else { "✗".red() };
        println!("{} {:<14} {}", marker, check.name, check.detail);
    }
    if let Some(resume) = report.resume {
        println!(
            "{} Resuming: {} done, {} failed, {} remaining",
            "→".cyan(),
            resume.done,
            resume.failed,
            resume.remaining
        );
    }
    if report.removed_scratch > 0 {
        println!("  Removed {} leftover scratch item(s)", report.removed_scratch);
    }
    if report.aborted_uploads > 0 {
        println!("  Aborted {} stale multipart upload(s)", report.aborted_uploads);
    }
}

pub fn print_validation(report: &ValidationReport) {
    let mut table = new_table();
    table.set_header(vec!["Check", "Result", "Summary"]);
    for check in &report.checks {
        let result = if check.passed {
            "PASS".green().to_string()
        } else {
            "FAIL".red().to_string()
        };
        table.add_row(vec![check.name.to_string(), result, check.summary.clone()]);
    }
    println!();
    println!("{}", "Postflight validation:".cyan().bold());
    println!("{}", table);

    if !report.errors.is_empty() {
        println!();
        for e in &report.errors {
            println!("  {} {}", "✗".red(), e);
        }
    }
    println!();
    if report.passed() {
        println!("{}", "✓ Validation passed".green().bold());
    } else {
        println!(
            "{}",
            format!("✗ Validation failed ({} problem(s))", report.errors.len())
                .red()
                .bold()
        );
    }
}

pub fn print_state(state: &PipelineState) {
    println!("{}", format!("Run {}", state.run_identity).cyan().bold());
    println!("  Archive:      {}", state.archive_path);
    println!("  Destination:  {}/{}", state.bucket, state.prefix);
    println!("  Last updated: {}", state.last_updated.to_rfc3339());
    println!();

    let mut table = new_table();
    table.set_header(vec!["Unit", "Status", "Attempts", "Size", "Detail"]);
    for (key, unit) in &state.units {
        let detail = match unit.status {
            UnitStatus::Failed => unit.last_error.clone().unwrap_or_default(),
            _ => unit.remote_location.clone().unwrap_or_default(),
        };
        table.add_row(vec![
            key.clone(),
            status_marker(unit.status),
            unit.attempts.to_string(),
            unit.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string()),
            detail,
        ]);
    }
    println!("{}", table);
    println!();
    println!("{}", "Summary:".cyan().bold());
    println!("  {}", counts_line(&state.counts()));
}
