//! Components and the stage lifecycle they move through.
//!
//! A component is one independently trackable unit of work. Its `stage` only
//! ever changes along the edges returned by [`Stage::can_transition_to`], and
//! only the stage router mutates it.

use crate::plan::ComponentSpec;
use crate::worker::message::{Feedback, Handoff, TestHandoff};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Position of a component in the fixed implement → review → test-write →
/// test-run pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Pending,
    Implementing,
    AwaitingReview,
    Reviewing,
    Approved,
    Rejected,
    AwaitingTests,
    WritingTests,
    AwaitingRun,
    Running,
    Passed,
    Failed,
    Blocked,
    Committed,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 14] = [
        Stage::Pending,
        Stage::Implementing,
        Stage::AwaitingReview,
        Stage::Reviewing,
        Stage::Approved,
        Stage::Rejected,
        Stage::AwaitingTests,
        Stage::WritingTests,
        Stage::AwaitingRun,
        Stage::Running,
        Stage::Passed,
        Stage::Failed,
        Stage::Blocked,
        Stage::Committed,
    ];

    /// `Committed` and `Blocked` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Committed | Stage::Blocked)
    }

    /// The component has left `Pending` but has not reached a terminal stage.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Stage::Pending
    }

    /// Whether `self -> next` is an edge of the stage graph.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Pending, Implementing)
                | (Implementing, AwaitingReview)
                | (AwaitingReview, Reviewing)
                | (Reviewing, Approved)
                | (Reviewing, Rejected)
                | (Approved, AwaitingTests)
                | (AwaitingTests, WritingTests)
                | (WritingTests, AwaitingRun)
                | (AwaitingRun, Running)
                | (Running, Passed)
                | (Running, Failed)
                | (Passed, Committed)
                // a commit that fails is terminal for the component
                | (Passed, Blocked)
                | (Rejected, Implementing)
                | (Rejected, Blocked)
                | (Failed, Implementing)
                | (Failed, Blocked)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Implementing => "implementing",
            Stage::AwaitingReview => "awaiting_review",
            Stage::Reviewing => "reviewing",
            Stage::Approved => "approved",
            Stage::Rejected => "rejected",
            Stage::AwaitingTests => "awaiting_tests",
            Stage::WritingTests => "writing_tests",
            Stage::AwaitingRun => "awaiting_run",
            Stage::Running => "running",
            Stage::Passed => "passed",
            Stage::Failed => "failed",
            Stage::Blocked => "blocked",
            Stage::Committed => "committed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A unit of work tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub files_to_create: BTreeSet<PathBuf>,
    pub files_to_modify: BTreeSet<PathBuf>,
    pub dependencies: BTreeSet<String>,
    /// Free-form implementation notes forwarded to the implementer.
    #[serde(default)]
    pub notes: String,
    /// What the test writer should cover.
    #[serde(default)]
    pub behavior_to_test: String,
    pub stage: Stage,
    pub rejection_count: u32,
    pub test_failure_count: u32,
    /// 1-based once implementation starts; bumped on every re-entry into
    /// `Implementing`.
    pub attempt: u32,
    /// Most recent implementer handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handoff: Option<Handoff>,
    /// Most recent test-writer handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_handoff: Option<TestHandoff>,
    /// Feedback from the last rejection or failing test run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<Feedback>,
}

impl Component {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            files_to_create: BTreeSet::new(),
            files_to_modify: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            notes: String::new(),
            behavior_to_test: String::new(),
            stage: Stage::Pending,
            rejection_count: 0,
            test_failure_count: 0,
            attempt: 0,
            last_handoff: None,
            test_handoff: None,
            last_feedback: None,
        }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Self {
        let mut component = Self::new(&spec.id);
        component.files_to_create = spec.files_to_create.iter().cloned().collect();
        component.files_to_modify = spec.files_to_modify.iter().cloned().collect();
        component.dependencies = spec.dependencies.iter().cloned().collect();
        component.notes = spec.notes.clone();
        component.behavior_to_test = spec.behavior_to_test.clone();
        component
    }

    /// Builder helper for a dependency edge.
    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.dependencies.insert(dependency.to_string());
        self
    }

    /// Builder helper for a file the component creates.
    pub fn creates(mut self, path: &str) -> Self {
        self.files_to_create.insert(PathBuf::from(path));
        self
    }

    /// Builder helper for a file the component modifies.
    pub fn modifies(mut self, path: &str) -> Self {
        self.files_to_modify.insert(PathBuf::from(path));
        self
    }

    /// Every file the component declares it will touch.
    pub fn files(&self) -> Vec<PathBuf> {
        self.files_to_create
            .iter()
            .chain(self.files_to_modify.iter())
            .cloned()
            .collect()
    }

    /// Files the implementer actually reported touching, falling back to the
    /// declared set before the first handoff.
    pub fn touched_files(&self) -> Vec<PathBuf> {
        match &self.last_handoff {
            Some(handoff) => handoff
                .files_created
                .iter()
                .chain(handoff.files_modified.iter())
                .cloned()
                .collect(),
            None => self.files(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Move to `next`, bumping `attempt` on entry to `Implementing`.
    ///
    /// Callers validate the edge first; this only applies the bookkeeping.
    pub(crate) fn enter(&mut self, next: Stage) {
        if next == Stage::Implementing {
            self.attempt += 1;
        }
        self.stage = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_stages_have_no_outgoing_edges() {
        for from in [Stage::Committed, Stage::Blocked] {
            assert!(from.is_terminal());
            for to in Stage::ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn test_committed_only_reachable_from_passed() {
        let sources: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(Stage::Committed))
            .collect();
        assert_eq!(sources, vec![Stage::Passed]);
    }

    #[test]
    fn test_happy_path_is_connected() {
        let path = [
            Stage::Pending,
            Stage::Implementing,
            Stage::AwaitingReview,
            Stage::Reviewing,
            Stage::Approved,
            Stage::AwaitingTests,
            Stage::WritingTests,
            Stage::AwaitingRun,
            Stage::Running,
            Stage::Passed,
            Stage::Committed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_retry_edges() {
        assert!(Stage::Rejected.can_transition_to(Stage::Implementing));
        assert!(Stage::Failed.can_transition_to(Stage::Implementing));
        assert!(Stage::Rejected.can_transition_to(Stage::Blocked));
        assert!(Stage::Failed.can_transition_to(Stage::Blocked));
        assert!(!Stage::Reviewing.can_transition_to(Stage::Implementing));
        assert!(!Stage::Pending.can_transition_to(Stage::Blocked));
    }

    #[test]
    fn test_enter_implementing_bumps_attempt() {
        let mut component = Component::new("api");
        assert_eq!(component.attempt, 0);
        component.enter(Stage::Implementing);
        assert_eq!(component.attempt, 1);
        component.enter(Stage::AwaitingReview);
        assert_eq!(component.attempt, 1);
        component.enter(Stage::Implementing);
        assert_eq!(component.attempt, 2);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::AwaitingReview).unwrap();
        assert_eq!(json, "\"awaiting_review\"");
        assert_eq!(Stage::AwaitingReview.to_string(), "awaiting_review");
    }

    #[test]
    fn test_touched_files_prefers_handoff() {
        let mut component = Component::new("api").creates("src/api.rs");
        assert_eq!(component.touched_files(), vec![PathBuf::from("src/api.rs")]);

        component.last_handoff = Some(Handoff {
            component_id: "api".into(),
            files_created: vec![PathBuf::from("src/api/mod.rs")],
            files_modified: vec![PathBuf::from("src/lib.rs")],
            summary: "split module".into(),
        });
        assert_eq!(
            component.touched_files(),
            vec![PathBuf::from("src/api/mod.rs"), PathBuf::from("src/lib.rs")]
        );
    }
}
