//! `stagehand plan`: validate a plan and print its schedule.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

pub fn cmd_plan(project_dir: &Path, file: &Path) -> Result<()> {
    use stagehand::graph::{GraphBuilder, ModeRequest};
    use stagehand::plan::PlanFile;

    let path = project_dir.join(file);
    let plan = PlanFile::load(&path)?;
    let graph = GraphBuilder::from_plan(&plan)
        .build()
        .with_context(|| format!("Invalid plan {}", path.display()))?;

    println!();
    if let Some(name) = &plan.name {
        println!("{}", style(name).bold().cyan());
    }
    println!(
        "{} components, {} edges, mode: {}",
        graph.len(),
        graph.edge_count(),
        style(graph.select_mode(ModeRequest::Auto)).bold()
    );
    println!();

    let conflicts = graph.conflict_edges();
    if !conflicts.is_empty() {
        println!("File conflicts (run in order):");
        for (first, second) in conflicts {
            println!("  {} -> {}", first, second);
        }
        println!();
    }

    if !graph.independent_groups().is_empty() {
        println!("Independent groups:");
        for (i, group) in graph.independent_groups().iter().enumerate() {
            println!("  {:<3} {}", i + 1, group.join(", "));
        }
        println!();
    }

    if !graph.sequential_chains().is_empty() {
        println!("Sequential chains:");
        for chain in graph.sequential_chains() {
            println!("  {}", chain.join(" -> "));
        }
        println!();
    }

    println!("Waves:");
    for (i, wave) in graph.compute_waves().iter().enumerate() {
        println!("  {:<3} {}", i + 1, style(wave.join(", ")).dim());
    }
    println!();
    Ok(())
}
