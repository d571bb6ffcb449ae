//! Configuration view and validation commands: `stagehand config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use stagehand::config::{CONFIG_FILE, StagehandConfig, StagehandToml};
    use stagehand::init::get_stagehand_dir;
    use stagehand::worker::Role;

    let stagehand_dir = get_stagehand_dir(project_dir);
    let config_path = stagehand_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stagehand Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                StagehandToml::load(&config_path)?
            } else {
                println!("No stagehand.toml found at {}", config_path.display());
                println!("Using default configuration.");
                StagehandToml::default()
            };
            println!();

            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            // Worker commands after env overrides
            let config = StagehandConfig::new(project_dir.to_path_buf())?;
            let commands = config.worker_commands();
            println!("Effective worker commands (with env overrides):");
            for role in Role::ALL {
                match commands.get(&role) {
                    Some(cmd) if cmd.args.is_empty() => {
                        println!("  {:<12} = \"{}\"", role, cmd.program)
                    }
                    Some(cmd) => println!(
                        "  {:<12} = \"{} {}\"",
                        role,
                        cmd.program,
                        cmd.args.join(" ")
                    ),
                    None => println!("  {:<12} (not set; {})", role, role.env_var()),
                }
            }
            println!();

            if !config_path.exists() {
                println!("Run 'stagehand config init' to create a stagehand.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No stagehand.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = StagehandToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stagehand.toml already exists at {}", config_path.display());
                println!("Remove it first to write a fresh default.");
                return Ok(());
            }

            std::fs::create_dir_all(&stagehand_dir).with_context(|| {
                format!("Failed to create directory: {}", stagehand_dir.display())
            })?;
            StagehandToml::default().save(&config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("Add a command for each role under [workers.<role>], for example:");
            println!();
            println!("  [workers.implementer]");
            println!("  command = \"my-agent\"");
            println!("  args = [\"--role\", \"implementer\"]");
            println!();
        }
    }

    Ok(())
}
