//! The end-of-run report: one outcome per component, nothing left out.

use super::{EscalationEvent, RecoveryRecord};
use crate::component::Stage;
use crate::graph::ExecutionMode;
use crate::retry::{BlockReason, EscalationRecord};
use crate::router::StageRouter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a component left the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentOutcome {
    Committed {
        revision: String,
    },
    Blocked {
        reason: BlockReason,
        record: Box<EscalationRecord>,
    },
    /// A declared dependency was blocked, so this never started.
    Unschedulable {
        blocked_by: String,
    },
    /// The run ended while the component could still have moved.
    Stalled {
        stage: Stage,
    },
}

impl ComponentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ComponentOutcome::Committed { .. } => "committed",
            ComponentOutcome::Blocked { .. } => "blocked",
            ComponentOutcome::Unschedulable { .. } => "unschedulable",
            ComponentOutcome::Stalled { .. } => "stalled",
        }
    }

    /// One line of causal explanation.
    pub fn note(&self) -> String {
        match self {
            ComponentOutcome::Committed { revision } => format!("committed as {}", revision),
            ComponentOutcome::Blocked { reason, .. } => reason.to_string(),
            ComponentOutcome::Unschedulable { blocked_by } => {
                format!("depends on blocked component {}", blocked_by)
            }
            ComponentOutcome::Stalled { stage } => format!("stopped while {}", stage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
    pub id: String,
    pub outcome: ComponentOutcome,
    pub rejection_count: u32,
    pub test_failure_count: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ExecutionMode,
    /// Plan order
    pub components: Vec<ComponentReport>,
    pub recycles: u32,
    #[serde(default)]
    pub recoveries: Vec<RecoveryRecord>,
    #[serde(default)]
    pub escalations: Vec<EscalationEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_path: Option<PathBuf>,
}

impl RunReport {
    pub(crate) fn from_router(
        router: &StageRouter,
        mode: ExecutionMode,
        recycles: u32,
        recoveries: Vec<RecoveryRecord>,
        escalations: Vec<EscalationEvent>,
    ) -> Self {
        let components = router
            .graph()
            .components()
            .iter()
            .map(|c| {
                let blocked = router
                    .escalations()
                    .iter()
                    .rev()
                    .find(|r| r.component_id == c.id);
                let outcome = match (c.stage, blocked) {
                    (Stage::Committed, _) => ComponentOutcome::Committed {
                        revision: router.commits().get(&c.id).cloned().unwrap_or_default(),
                    },
                    (Stage::Blocked, Some(record)) => ComponentOutcome::Blocked {
                        reason: record.reason.clone(),
                        record: Box::new(record.clone()),
                    },
                    _ => match router.unschedulable().get(&c.id) {
                        Some(blocker) => ComponentOutcome::Unschedulable {
                            blocked_by: blocker.clone(),
                        },
                        None => ComponentOutcome::Stalled { stage: c.stage },
                    },
                };
                ComponentReport {
                    id: c.id.clone(),
                    outcome,
                    rejection_count: c.rejection_count,
                    test_failure_count: c.test_failure_count,
                    attempts: c.attempt,
                }
            })
            .collect();

        let audit = router.audit();
        Self {
            run_id: audit.run_id().to_string(),
            started_at: audit.started_at(),
            finished_at: Utc::now(),
            mode,
            components,
            recycles,
            recoveries,
            escalations,
            audit_path: audit.path().map(|p| p.to_path_buf()),
        }
    }

    pub fn outcome(&self, id: &str) -> Option<&ComponentOutcome> {
        self.components
            .iter()
            .find(|c| c.id == id)
            .map(|c| &c.outcome)
    }

    fn ids_where(&self, label: &str) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| c.outcome.label() == label)
            .map(|c| c.id.as_str())
            .collect()
    }

    pub fn committed(&self) -> Vec<&str> {
        self.ids_where("committed")
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.ids_where("blocked")
    }

    pub fn unschedulable(&self) -> Vec<&str> {
        self.ids_where("unschedulable")
    }

    pub fn stalled(&self) -> Vec<&str> {
        self.ids_where("stalled")
    }

    /// Every component committed and nobody had to be asked.
    pub fn is_success(&self) -> bool {
        self.committed().len() == self.components.len() && self.escalations.is_empty()
    }

    /// The run stopped for a decision only the caller can make.
    pub fn needs_decision(&self) -> bool {
        self.escalations
            .iter()
            .any(|e| !matches!(e, EscalationEvent::ComponentBlocked { .. }))
    }
}
