use crate::component::Stage;
use crate::worker::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Router,
    Worker(Role),
    RetryManager,
    Committer,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Router => f.pad("router"),
            Actor::Worker(role) => f.pad(role.as_str()),
            Actor::RetryManager => f.pad("retry-manager"),
            Actor::Committer => f.pad("committer"),
        }
    }
}

/// One stage transition. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub component_id: String,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

impl AuditRecord {
    pub fn new(component_id: &str, from_stage: Stage, to_stage: Stage, actor: Actor) -> Self {
        Self {
            timestamp: Utc::now(),
            component_id: component_id.to_string(),
            from_stage,
            to_stage,
            actor,
            note: String::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

pub mod logger;
pub use logger::{AuditLog, find_run, list_runs, load_records, load_summary, summary_path};
