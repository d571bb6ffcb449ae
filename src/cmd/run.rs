//! `stagehand run`: execute a plan.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;

/// Run the plan and return the process exit code: 0 when everything
/// committed, 1 when some component did not, 2 when the run stopped for a
/// decision.
pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    file: &Path,
    sequential: bool,
    dry_run: bool,
) -> Result<i32> {
    use stagehand::audit::AuditLog;
    use stagehand::commit::{Committer, GitCommitter, NoopCommitter};
    use stagehand::config::StagehandConfig;
    use stagehand::graph::GraphBuilder;
    use stagehand::logging::init_logging;
    use stagehand::orchestrator::Orchestrator;
    use stagehand::plan::PlanFile;
    use stagehand::worker::{BackendFactory, ProcessFactory, Script, ScriptedFactory};

    let config =
        StagehandConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, sequential)?;
    config.ensure_directories()?;
    let _log_guard = init_logging(&config.log_dir(), cli.verbose)?;

    for warning in config.validate() {
        println!("{} {}", style("warning:").yellow().bold(), warning);
    }

    let plan_path = config.project_dir.join(file);
    let plan = PlanFile::load(&plan_path)?;
    let graph = GraphBuilder::from_plan(&plan)
        .build()
        .with_context(|| format!("Invalid plan {}", plan_path.display()))?;

    let factory: Arc<dyn BackendFactory> = if dry_run {
        Arc::new(ScriptedFactory::new(Script::new()))
    } else {
        let factory = ProcessFactory::new(config.worker_commands(), config.project_dir.clone());
        let missing = factory.missing_roles();
        if !missing.is_empty() {
            let hints: Vec<String> = missing
                .iter()
                .map(|r| format!("[workers.{}] or {}", r, r.env_var()))
                .collect();
            anyhow::bail!(
                "No worker command configured for: {}. Use --dry-run to try the plan with scripted workers.",
                hints.join(", ")
            );
        }
        Arc::new(factory)
    };

    let committer: Box<dyn Committer> = if dry_run || !config.toml.commit.enabled {
        Box::new(NoopCommitter::new())
    } else {
        Box::new(GitCommitter::open(
            &config.project_dir,
            &config.toml.commit.author_name,
            &config.toml.commit.author_email,
        )?)
    };

    let audit = AuditLog::create(&config.audit_dir())?;
    let run_id = audit.run_id();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator = Orchestrator::with_channel_workers(
        graph,
        factory,
        audit,
        committer,
        config.orchestrator_config(),
    )?
    .with_escalation_channel(tx);

    println!();
    println!(
        "{} {} ({} components, mode {}{})",
        style("Running").bold().cyan(),
        plan.name.as_deref().unwrap_or("plan"),
        plan.components.len(),
        orchestrator.mode(),
        if dry_run { ", dry run" } else { "" }
    );
    println!("Run id: {}", style(run_id).dim());
    println!();

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            super::audit::print_escalation(&event);
        }
    });

    let report = orchestrator.run().await?;
    printer.await.ok();

    super::audit::print_report(&report);

    Ok(if report.needs_decision() {
        2
    } else if report.is_success() {
        0
    } else {
        1
    })
}
