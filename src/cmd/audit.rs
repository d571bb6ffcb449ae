//! `stagehand audit`: inspect persisted runs, plus the report printers
//! shared with `run`.

use anyhow::Result;
use console::style;
use std::path::Path;

use stagehand::orchestrator::{ComponentOutcome, EscalationEvent, RunReport};

use super::super::AuditCommands;

pub fn cmd_audit(project_dir: &Path, command: &AuditCommands) -> Result<()> {
    use stagehand::config::StagehandConfig;

    let config = StagehandConfig::new(project_dir.to_path_buf())?;
    let audit_dir = config.audit_dir();

    match command {
        AuditCommands::List => list(&audit_dir),
        AuditCommands::Show { run } => show(&audit_dir, run),
    }
}

fn list(audit_dir: &Path) -> Result<()> {
    use stagehand::audit::{list_runs, load_summary};

    let runs = list_runs(audit_dir)?;
    if runs.is_empty() {
        println!("No runs recorded in {}", audit_dir.display());
        return Ok(());
    }

    println!();
    println!("{}", style("Recorded runs").bold());
    for run in runs {
        let name = run
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let status = match load_summary::<RunReport>(&run)? {
            Some(report) => summary_line(&report),
            None => style("incomplete").yellow().to_string(),
        };
        println!("  {:<52} {}", name, status);
    }
    println!();
    Ok(())
}

fn show(audit_dir: &Path, needle: &str) -> Result<()> {
    use stagehand::audit::{find_run, load_records, load_summary};

    let Some(run) = find_run(audit_dir, needle)? else {
        anyhow::bail!("No run matching '{}' in {}", needle, audit_dir.display());
    };

    let records = load_records(&run)?;
    println!();
    println!("{} {}", style("Run").bold(), run.display());
    println!();
    println!("{}", style("Transitions").bold());
    for record in &records {
        let note = if record.note.is_empty() {
            String::new()
        } else {
            format!("  {}", style(&record.note).dim())
        };
        println!(
            "  {} {:<20} {:>13} -> {:<13} {:<12}{}",
            style(record.timestamp.format("%H:%M:%S%.3f")).dim(),
            record.component_id,
            record.from_stage,
            record.to_stage,
            record.actor,
            note
        );
    }

    match load_summary::<RunReport>(&run)? {
        Some(report) => print_report(&report),
        None => {
            println!();
            println!(
                "{} the run did not finish; only transitions are available.",
                style("note:").yellow()
            );
        }
    }
    Ok(())
}

fn summary_line(report: &RunReport) -> String {
    let committed = report.committed().len();
    let total = report.components.len();
    let text = format!("{}/{} committed", committed, total);
    if report.is_success() {
        style(text).green().to_string()
    } else if report.needs_decision() {
        format!("{} {}", style(text).red(), style("(needs decision)").red().bold())
    } else {
        style(text).yellow().to_string()
    }
}

pub fn print_escalation(event: &EscalationEvent) {
    let tag = style("escalation:").red().bold();
    match event {
        EscalationEvent::ComponentBlocked { record } => {
            println!("{} {} blocked: {}", tag, record.component_id, record.reason);
            println!("    {}", style(&record.resolution_note).dim());
        }
        EscalationEvent::RepeatedSilentFailure {
            role,
            failures,
            reason,
            stranded,
        } => {
            println!(
                "{} {} worker failed {} times ({}); role halted",
                tag, role, failures, reason
            );
            if !stranded.is_empty() {
                println!("    stranded: {}", stranded.join(", "));
            }
        }
        EscalationEvent::MajorityBlocked { blocked, total } => {
            println!(
                "{} {} of {} components blocked; no new components will start",
                tag, blocked, total
            );
        }
    }
}

pub fn print_report(report: &RunReport) {
    println!();
    println!(
        "{} {} ({})",
        style("Report").bold(),
        style(&report.run_id).dim(),
        report.mode
    );
    for component in &report.components {
        let label = match &component.outcome {
            ComponentOutcome::Committed { .. } => style(component.outcome.label()).green(),
            ComponentOutcome::Blocked { .. } => style(component.outcome.label()).red(),
            ComponentOutcome::Unschedulable { .. } | ComponentOutcome::Stalled { .. } => {
                style(component.outcome.label()).yellow()
            }
        };
        println!(
            "  {:<24} {:<14} {}",
            component.id,
            label,
            style(component.outcome.note()).dim()
        );
        if component.rejection_count > 0 || component.test_failure_count > 0 {
            println!(
                "  {:<24} {} rejections, {} test failures, {} attempts",
                "", component.rejection_count, component.test_failure_count, component.attempts
            );
        }
    }

    if report.recycles > 0 || !report.recoveries.is_empty() {
        println!();
        println!(
            "Workers: {} recycled, {} recovered",
            report.recycles,
            report.recoveries.len()
        );
        for recovery in &report.recoveries {
            println!(
                "  {} #{} {}{}",
                recovery.role,
                recovery.failure_number,
                recovery.reason,
                recovery
                    .in_flight
                    .as_deref()
                    .map(|id| format!(" (redelivered {})", id))
                    .unwrap_or_default()
            );
        }
    }

    println!();
    println!("{}", summary_line(report));
    if let Some(path) = &report.audit_path {
        println!("Audit log: {}", style(path.display()).dim());
    }
}
