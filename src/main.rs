use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Drive components through implement, review and test stages")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .stagehand directory with a default configuration
    Init,
    /// Validate a plan file and show how it would be scheduled
    Plan {
        /// Plan file (JSON, or YAML by extension)
        file: PathBuf,
    },
    /// Run every component of a plan through the pipeline
    Run {
        /// Plan file (JSON, or YAML by extension)
        file: PathBuf,

        /// Run one component at a time regardless of the graph
        #[arg(long)]
        sequential: bool,

        /// Use scripted approve-all workers and skip commits
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect persisted runs
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum AuditCommands {
    /// List recorded runs, newest first
    List,
    /// Show the transitions and outcome of one run
    Show {
        /// Run id prefix, timestamp fragment, or "latest"
        run: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default stagehand.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Plan { file } => cmd::cmd_plan(&project_dir, file)?,
        Commands::Run {
            file,
            sequential,
            dry_run,
        } => {
            let code = cmd::cmd_run(&cli, &project_dir, file, *sequential, *dry_run).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Audit { command } => cmd::cmd_audit(&project_dir, command)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
