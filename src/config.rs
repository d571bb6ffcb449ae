//! Configuration for stagehand, read from `.stagehand/stagehand.toml`.
//!
//! Settings are layered file → environment → CLI. Every key has a default,
//! so an empty or missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! mode = "auto"            # or "sequential"
//! poll_interval_ms = 50
//!
//! [backpressure]
//! review = 2
//! test_write = 2
//! test_run = 3
//!
//! [retry]
//! max_rejections = 3
//! max_test_failures = 2
//!
//! [health]
//! monitor_interval_ms = 60000
//! probe_after_cycles = 1
//! recover_after_cycles = 2
//! max_silent_failures = 2
//!
//! [health.recycle_thresholds]
//! implementer = 40
//! reviewer = 60
//! test_writer = 40
//! test_runner = 80
//!
//! [escalation]
//! blocked_fraction = 0.5
//!
//! [commit]
//! enabled = true
//! author_name = "stagehand"
//! author_email = "stagehand@localhost"
//!
//! [workers.implementer]
//! command = "my-agent"
//! args = ["--role", "implementer"]
//! ```

use crate::graph::ModeRequest;
use crate::health::{HealthPolicy, RecycleThresholds};
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;
use crate::router::Capacities;
use crate::worker::{Role, WorkerCommand};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STAGEHAND_DIR: &str = ".stagehand";
pub const CONFIG_FILE: &str = "stagehand.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub mode: ModeRequest,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            mode: ModeRequest::Auto,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    /// Length of one monitoring cycle
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_probe_after_cycles")]
    pub probe_after_cycles: u32,
    #[serde(default = "default_recover_after_cycles")]
    pub recover_after_cycles: u32,
    #[serde(default = "default_max_silent_failures")]
    pub max_silent_failures: u32,
    #[serde(default)]
    pub recycle_thresholds: RecycleThresholds,
}

fn default_monitor_interval_ms() -> u64 {
    60_000
}

fn default_probe_after_cycles() -> u32 {
    1
}

fn default_recover_after_cycles() -> u32 {
    2
}

fn default_max_silent_failures() -> u32 {
    2
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            probe_after_cycles: default_probe_after_cycles(),
            recover_after_cycles: default_recover_after_cycles(),
            max_silent_failures: default_max_silent_failures(),
            recycle_thresholds: RecycleThresholds::default(),
        }
    }
}

impl HealthSection {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            probe_after_cycles: self.probe_after_cycles,
            recover_after_cycles: self.recover_after_cycles,
            max_silent_failures: self.max_silent_failures,
            recycle_thresholds: self.recycle_thresholds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSection {
    /// Share of blocked components above which no new components start
    #[serde(default = "default_blocked_fraction")]
    pub blocked_fraction: f64,
}

fn default_blocked_fraction() -> f64 {
    0.5
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            blocked_fraction: default_blocked_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSection {
    #[serde(default = "default_commit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_commit_enabled() -> bool {
    true
}

fn default_author_name() -> String {
    "stagehand".to_string()
}

fn default_author_email() -> String {
    "stagehand@localhost".to_string()
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            enabled: default_commit_enabled(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

/// `[workers.<role>]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The complete stagehand.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagehandToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub backpressure: Capacities,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub commit: CommitSection,
    /// Keyed by role name (`implementer`, `test-writer`, ...)
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerSection>,
}

impl StagehandToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagehand.toml")
    }

    /// Load `<stagehand_dir>/stagehand.toml`, or defaults if it is missing.
    pub fn load_or_default(stagehand_dir: &Path) -> Result<Self> {
        let config_path = stagehand_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize stagehand.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Worker commands per role. `STAGEHAND_<ROLE>_CMD` replaces the file
    /// setting; its value is split on whitespace into program and args.
    pub fn worker_commands(&self) -> BTreeMap<Role, WorkerCommand> {
        let mut commands = BTreeMap::new();
        for (name, section) in &self.workers {
            if let Ok(role) = name.parse::<Role>()
                && !section.command.trim().is_empty()
            {
                commands.insert(
                    role,
                    WorkerCommand {
                        program: section.command.clone(),
                        args: section.args.clone(),
                    },
                );
            }
        }

        for role in Role::ALL {
            if let Ok(value) = std::env::var(role.env_var()) {
                let mut parts = value.split_whitespace().map(String::from);
                if let Some(program) = parts.next() {
                    commands.insert(
                        role,
                        WorkerCommand {
                            program,
                            args: parts.collect(),
                        },
                    );
                }
            }
        }
        commands
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            mode: self.pipeline.mode,
            capacities: self.backpressure,
            retry: self.retry,
            health: self.health.policy(),
            poll_interval: Duration::from_millis(self.pipeline.poll_interval_ms),
            monitor_interval: Duration::from_millis(self.health.monitor_interval_ms),
            blocked_fraction: self.escalation.blocked_fraction,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, capacity) in [
            ("review", self.backpressure.review),
            ("test_write", self.backpressure.test_write),
            ("test_run", self.backpressure.test_run),
        ] {
            if capacity == 0 {
                warnings.push(format!(
                    "backpressure.{} is 0: components will never leave the hold list",
                    name
                ));
            }
        }

        if self.retry.max_rejections == 0 || self.retry.max_test_failures == 0 {
            warnings.push(
                "retry limits of 0 block a component on its first rejection or failure".to_string(),
            );
        }

        if self.health.recover_after_cycles <= self.health.probe_after_cycles {
            warnings.push(format!(
                "health.recover_after_cycles ({}) should be greater than probe_after_cycles ({})",
                self.health.recover_after_cycles, self.health.probe_after_cycles
            ));
        }
        if self.health.max_silent_failures == 0 {
            warnings.push("health.max_silent_failures is 0: the first failure escalates".to_string());
        }
        if self.health.monitor_interval_ms == 0 || self.pipeline.poll_interval_ms == 0 {
            warnings.push("intervals of 0 ms make the run loop spin".to_string());
        }

        if !(0.0..=1.0).contains(&self.escalation.blocked_fraction) {
            warnings.push(format!(
                "escalation.blocked_fraction {} is outside 0.0..=1.0",
                self.escalation.blocked_fraction
            ));
        }

        for (name, section) in &self.workers {
            if name.parse::<Role>().is_err() {
                warnings.push(format!(
                    "Unknown worker role '{}'. Valid roles: implementer, reviewer, test-writer, test-runner",
                    name
                ));
            } else if section.command.trim().is_empty() {
                warnings.push(format!("workers.{} has an empty command", name));
            }
        }

        warnings
    }
}

/// Resolved configuration for one project.
#[derive(Debug, Clone)]
pub struct StagehandConfig {
    pub project_dir: PathBuf,
    pub stagehand_dir: PathBuf,
    pub toml: StagehandToml,
    pub verbose: bool,
    cli_sequential: bool,
}

impl StagehandConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let stagehand_dir = project_dir.join(STAGEHAND_DIR);
        let toml = StagehandToml::load_or_default(&stagehand_dir)?;

        Ok(Self {
            project_dir,
            stagehand_dir,
            toml,
            verbose: false,
            cli_sequential: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, sequential: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_sequential = sequential;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.stagehand_dir.join(CONFIG_FILE)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.stagehand_dir.join("audit")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.stagehand_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.audit_dir().join("runs"))
            .context("Failed to create audit directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }

    /// Run settings (CLI → file → default).
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = self.toml.orchestrator_config();
        if self.cli_sequential {
            config.mode = ModeRequest::Sequential;
        }
        config
    }

    pub fn worker_commands(&self) -> BTreeMap<Role, WorkerCommand> {
        self.toml.worker_commands()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = StagehandToml::parse("").unwrap();
        assert_eq!(config.pipeline.mode, ModeRequest::Auto);
        assert_eq!(config.backpressure, Capacities::default());
        assert_eq!(config.retry.max_rejections, 3);
        assert_eq!(config.retry.max_test_failures, 2);
        assert_eq!(config.health.recycle_thresholds.get(Role::TestRunner), 80);
        assert!(config.commit.enabled);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = StagehandToml::parse(
            r#"
[pipeline]
mode = "sequential"

[backpressure]
review = 4

[health.recycle_thresholds]
implementer = 10
"#,
        )
        .unwrap();
        assert_eq!(config.pipeline.mode, ModeRequest::Sequential);
        assert_eq!(config.pipeline.poll_interval_ms, 50);
        assert_eq!(config.backpressure.review, 4);
        assert_eq!(config.backpressure.test_run, 3);
        assert_eq!(config.health.recycle_thresholds.implementer, 10);
        assert_eq!(config.health.recycle_thresholds.reviewer, 60);
    }

    #[test]
    fn test_orchestrator_config_maps_sections() {
        let config = StagehandToml::parse(
            r#"
[health]
monitor_interval_ms = 250
max_silent_failures = 3

[escalation]
blocked_fraction = 0.75
"#,
        )
        .unwrap();
        let run = config.orchestrator_config();
        assert_eq!(run.monitor_interval, Duration::from_millis(250));
        assert_eq!(run.health.max_silent_failures, 3);
        assert_eq!(run.blocked_fraction, 0.75);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let config = StagehandToml::parse(
            r#"
[backpressure]
review = 0

[health]
probe_after_cycles = 2
recover_after_cycles = 2

[escalation]
blocked_fraction = 1.5

[workers.lead]
command = "x"
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("backpressure.review")));
        assert!(warnings.iter().any(|w| w.contains("Unknown worker role 'lead'")));
    }

    #[test]
    fn test_worker_commands_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = StagehandToml::parse(
            r#"
[workers.reviewer]
command = "review-bot"
args = ["--strict"]

[workers.test-runner]
command = "run-tests"
"#,
        )
        .unwrap();

        let saved = std::env::var("STAGEHAND_REVIEWER_CMD").ok();
        unsafe { std::env::set_var("STAGEHAND_REVIEWER_CMD", "other-bot --fast") };
        let commands = config.worker_commands();
        match saved {
            Some(val) => unsafe { std::env::set_var("STAGEHAND_REVIEWER_CMD", val) },
            None => unsafe { std::env::remove_var("STAGEHAND_REVIEWER_CMD") },
        }

        assert_eq!(commands[&Role::Reviewer].program, "other-bot");
        assert_eq!(commands[&Role::Reviewer].args, vec!["--fast"]);
        assert_eq!(commands[&Role::TestRunner].program, "run-tests");
        assert!(!commands.contains_key(&Role::Implementer));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = StagehandToml::default();
        config.retry.max_rejections = 5;
        config.save(&path).unwrap();

        let loaded = StagehandToml::load(&path).unwrap();
        assert_eq!(loaded.retry.max_rejections, 5);
    }

    #[test]
    fn test_stagehand_config_paths_and_cli_override() {
        let dir = tempdir().unwrap();
        let config = StagehandConfig::with_cli_args(dir.path().to_path_buf(), false, true).unwrap();
        assert!(config.audit_dir().ends_with(".stagehand/audit"));
        assert_eq!(config.orchestrator_config().mode, ModeRequest::Sequential);

        config.ensure_directories().unwrap();
        assert!(config.audit_dir().join("runs").is_dir());
        assert!(config.log_dir().is_dir());
    }
}
