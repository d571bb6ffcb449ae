//! `stagehand init`: create the `.stagehand/` directory in a project.
//!
//! ```text
//! .stagehand/
//! ├── stagehand.toml   # Default configuration
//! ├── audit/
//! │   └── runs/        # One JSONL file and one summary per run
//! └── logs/            # stagehand.log
//! ```

use crate::config::{CONFIG_FILE, STAGEHAND_DIR, StagehandToml};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub stagehand_dir: PathBuf,
    /// False if the directory already existed
    pub created: bool,
    /// Whether a default stagehand.toml was written
    pub wrote_config: bool,
}

/// Initialize stagehand in `project_dir`. Existing files are left alone;
/// missing directories are filled in.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let stagehand_dir = get_stagehand_dir(project_dir);
    let created = !stagehand_dir.exists();

    let runs_dir = stagehand_dir.join("audit").join("runs");
    std::fs::create_dir_all(&runs_dir)
        .with_context(|| format!("Failed to create runs directory: {}", runs_dir.display()))?;

    let logs_dir = stagehand_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;

    let config_file = stagehand_dir.join(CONFIG_FILE);
    let wrote_config = !config_file.exists();
    if wrote_config {
        StagehandToml::default().save(&config_file)?;
    }

    Ok(InitResult {
        stagehand_dir,
        created,
        wrote_config,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    get_stagehand_dir(project_dir).exists()
}

pub fn get_stagehand_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STAGEHAND_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_structure() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));

        let result = init_project(dir.path()).unwrap();
        assert!(result.created);
        assert!(result.wrote_config);
        assert!(result.stagehand_dir.join("audit/runs").is_dir());
        assert!(result.stagehand_dir.join("logs").is_dir());
        assert!(is_initialized(dir.path()));

        let config = StagehandToml::load(&result.stagehand_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(config.retry.max_rejections, 3);
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = tempdir().unwrap();
        let stagehand_dir = get_stagehand_dir(dir.path());
        std::fs::create_dir_all(&stagehand_dir).unwrap();
        std::fs::write(stagehand_dir.join(CONFIG_FILE), "[retry]\nmax_rejections = 7\n").unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);
        assert!(!result.wrote_config);
        assert!(stagehand_dir.join("audit/runs").is_dir());

        let config = StagehandToml::load(&stagehand_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(config.retry.max_rejections, 7);
    }

    #[test]
    fn test_get_stagehand_dir() {
        assert_eq!(
            get_stagehand_dir(Path::new("/tmp/project")),
            PathBuf::from("/tmp/project/.stagehand")
        );
    }
}
