//! Project initialization command.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use stagehand::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized stagehand project at {}",
            result.stagehand_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .stagehand/");
        println!("  ├── stagehand.toml   # Configuration (use `stagehand config show`)");
        println!("  ├── audit/runs/      # Transition log and report per run");
        println!("  └── logs/            # stagehand.log");
        println!();
        println!("Next steps:");
        println!("  1. Configure a command per role under [workers.<role>]");
        println!("  2. Run `stagehand plan <plan.json>` to check the schedule");
        println!("  3. Run `stagehand run <plan.json>` to start");
    } else {
        println!(
            "Stagehand project already initialized at {}",
            result.stagehand_dir.display()
        );
        if result.wrote_config {
            println!("Wrote missing stagehand.toml.");
        }
        println!("Directory structure verified.");
    }

    Ok(())
}
