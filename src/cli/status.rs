//! The `status` command and report rendering

use anyhow::Result;

use super::output::Output;
use crate::diagnostics::StatusReport;
use crate::storage::Workspace;

pub fn run(workspace: &Workspace, output: &Output) -> Result<()> {
    match StatusReport::load(&workspace.status_path())? {
        Some(report) => print_report(output, &report),
        None if output.is_json() => output.data(&serde_json::Value::Null),
        None => println!("No load recorded yet. Run 'unitwave load' first."),
    }
    Ok(())
}

/// Renders a report as a table or as JSON
pub fn print_report(output: &Output, report: &StatusReport) {
    if output.is_json() {
        output.data(report);
        return;
    }

    let elapsed = report.finished_at - report.started_at;
    println!(
        "Load of {} units in {} waves (mode: {}, {} ms)",
        report.units.len(),
        report.waves.len(),
        report.mode,
        elapsed.num_milliseconds()
    );
    if report.cancelled {
        println!("Load was cancelled before all waves finished.");
    }
    println!("{}", "=".repeat(60));
    println!("{:<6} {:<24} {:<18} DETAIL", "WAVE", "UNIT", "OUTCOME");
    for unit in &report.units {
        let wave = unit.wave.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string());
        let outcome = if unit.fallback_used {
            format!("{} (fallback)", unit.outcome)
        } else {
            unit.outcome.to_string()
        };
        println!(
            "{:<6} {:<24} {:<18} {}",
            wave,
            unit.id.as_str(),
            outcome,
            unit.detail.as_deref().unwrap_or("")
        );
    }

    if !report.open_breakers.is_empty() {
        output.blank();
        println!("Open circuit breakers:");
        for breaker in &report.open_breakers {
            println!(
                "  {} ({} consecutive failures{})",
                breaker.unit_id,
                breaker.consecutive_failures,
                if breaker.has_fallback { ", fallback registered" } else { "" }
            );
        }
    }

    output.blank();
    let summary: Vec<String> = report
        .summary()
        .iter()
        .map(|(outcome, count)| format!("{} {}", count, outcome))
        .collect();
    println!("Summary: {}", summary.join(", "));
    if report.error_count > 0 {
        println!(
            "{} error(s) recorded. Run 'unitwave errors' for details.",
            report.error_count
        );
    }
}
