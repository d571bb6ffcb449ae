//! Plan file loading.
//!
//! A plan is the static output of architecture planning: a flat list of
//! components with their declared dependencies and file sets. JSON is the
//! default format; `.yaml`/`.yml` files are parsed as YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One component as declared in the plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ComponentSpec {
    /// Unique component id
    pub id: String,
    /// Files the component creates
    #[serde(default)]
    pub files_to_create: Vec<PathBuf>,
    /// Files the component modifies
    #[serde(default)]
    pub files_to_modify: Vec<PathBuf>,
    /// Ids of components that must be committed first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Notes forwarded to the implementer
    #[serde(default)]
    pub notes: String,
    /// Behaviour the test writer should cover
    #[serde(default)]
    pub behavior_to_test: String,
}

impl ComponentSpec {
    pub fn new(id: &str, dependencies: Vec<&str>) -> Self {
        Self {
            id: id.to_string(),
            dependencies: dependencies.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }
}

/// The full plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanFile {
    /// Optional human-readable plan name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub components: Vec<ComponentSpec>,
    /// Extra pairs of components that must not run concurrently, on top of
    /// the conflicts derived from overlapping file sets
    #[serde(default)]
    pub conflicts: Vec<[String; 2]>,
}

impl PlanFile {
    /// Load a plan from a JSON or YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);

        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse plan YAML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))
        }
    }

    /// Save the plan as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        Ok(())
    }

    pub fn get_component(&self, id: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.id == id)
    }
}
