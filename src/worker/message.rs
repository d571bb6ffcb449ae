//! Typed messages exchanged with workers.
//!
//! Outbound messages carry a [`OutboundKind`] and the attempt number; inbound
//! messages carry the worker's self-reported `turn_count`. Both are immutable
//! once sent. Payloads serialize with a `type` tag so process workers can
//! speak plain JSON.

use super::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Why an outbound message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// First contact for this component at this stage
    Assignment,
    /// Re-implementation after a review rejection
    Revision,
    /// Re-implementation after a failing test run
    Fix,
}

/// Review or test feedback forwarded to the implementer on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub source: FeedbackSource,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    Review,
    Tests,
}

/// Work handed to the implementer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub component_id: String,
    pub files: Vec<PathBuf>,
    pub notes: String,
    pub attempt: u32,
    pub revision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

/// The implementer's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub component_id: String,
    #[serde(default)]
    pub files_created: Vec<PathBuf>,
    #[serde(default)]
    pub files_modified: Vec<PathBuf>,
    #[serde(default)]
    pub summary: String,
}

/// The test writer's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHandoff {
    pub component_id: String,
    pub test_files: Vec<PathBuf>,
    pub test_count: u32,
    pub run_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
}

/// Role-specific body of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    Assignment(Assignment),
    ReviewRequest {
        component_id: String,
        handoff: Handoff,
    },
    TestRequest {
        component_id: String,
        files: Vec<PathBuf>,
        behavior_to_test: String,
    },
    TestExecution {
        component_id: String,
        test_files: Vec<PathBuf>,
        run_command: String,
    },
}

impl OutboundPayload {
    /// The role this payload is addressed to.
    pub fn role(&self) -> Role {
        match self {
            OutboundPayload::Assignment(_) => Role::Implementer,
            OutboundPayload::ReviewRequest { .. } => Role::Reviewer,
            OutboundPayload::TestRequest { .. } => Role::TestWriter,
            OutboundPayload::TestExecution { .. } => Role::TestRunner,
        }
    }
}

/// Router → worker envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub component_id: String,
    pub kind: OutboundKind,
    pub attempt: u32,
    pub payload: OutboundPayload,
}

/// Coarse classification of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Handoff,
    Result,
    Failure,
}

/// Role-specific body of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPayload {
    Handoff(Handoff),
    ReviewResult {
        component_id: String,
        verdict: Verdict,
        #[serde(default)]
        issues: Vec<String>,
    },
    TestHandoff(TestHandoff),
    TestResult {
        component_id: String,
        status: TestStatus,
        #[serde(default)]
        failures: Vec<String>,
    },
    /// The worker could not process the item at all.
    Failure { reason: String },
}

impl InboundPayload {
    pub fn name(&self) -> &'static str {
        match self {
            InboundPayload::Handoff(_) => "handoff",
            InboundPayload::ReviewResult { .. } => "review result",
            InboundPayload::TestHandoff(_) => "test handoff",
            InboundPayload::TestResult { .. } => "test result",
            InboundPayload::Failure { .. } => "failure",
        }
    }
}

/// Worker → router envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub component_id: String,
    pub payload: InboundPayload,
    /// Self-reported turn counter of the instance that produced this message
    pub turn_count: u32,
}

impl InboundMessage {
    pub fn kind(&self) -> InboundKind {
        match self.payload {
            InboundPayload::Handoff(_) | InboundPayload::TestHandoff(_) => InboundKind::Handoff,
            InboundPayload::ReviewResult { .. } | InboundPayload::TestResult { .. } => {
                InboundKind::Result
            }
            InboundPayload::Failure { .. } => InboundKind::Failure,
        }
    }

    pub fn failure(component_id: &str, reason: impl Into<String>, turn_count: u32) -> Self {
        Self {
            component_id: component_id.to_string(),
            payload: InboundPayload::Failure {
                reason: reason.into(),
            },
            turn_count,
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.payload.name(), self.component_id)
    }
}

/// Asks a worker to wrap up and summarise its context before recycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub role: Role,
    pub reason: String,
}

/// A worker's summary of its own context, seeded into its replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HandoffSummary {
    pub reason: String,
    #[serde(default)]
    pub completed_work: Vec<String>,
    #[serde(default)]
    pub in_progress: Vec<String>,
    #[serde(default)]
    pub context_notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_kind_classification() {
        let handoff = InboundMessage {
            component_id: "a".into(),
            payload: InboundPayload::Handoff(Handoff {
                component_id: "a".into(),
                files_created: vec![],
                files_modified: vec![],
                summary: String::new(),
            }),
            turn_count: 3,
        };
        assert_eq!(handoff.kind(), InboundKind::Handoff);
        assert_eq!(
            InboundMessage::failure("a", "crashed", 0).kind(),
            InboundKind::Failure
        );
    }

    #[test]
    fn test_review_result_parses_from_worker_json() {
        let json = r#"{
            "component_id": "api",
            "turn_count": 7,
            "payload": {"type": "review_result", "component_id": "api", "verdict": "rejected", "issues": ["missing error path"]}
        }"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind(), InboundKind::Result);
        match msg.payload {
            InboundPayload::ReviewResult { verdict, issues, .. } => {
                assert_eq!(verdict, Verdict::Rejected);
                assert_eq!(issues, vec!["missing error path"]);
            }
            other => panic!("Expected ReviewResult, got {:?}", other),
        }
    }

    #[test]
    fn test_outbound_assignment_json_shape() {
        let msg = OutboundMessage {
            component_id: "api".into(),
            kind: OutboundKind::Revision,
            attempt: 2,
            payload: OutboundPayload::Assignment(Assignment {
                component_id: "api".into(),
                files: vec![PathBuf::from("src/api.rs")],
                notes: String::new(),
                attempt: 2,
                revision: true,
                feedback: None,
            }),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "revision");
        assert_eq!(value["payload"]["type"], "assignment");
        assert_eq!(value["payload"]["revision"], true);
        assert!(value["payload"].get("feedback").is_none());
        assert_eq!(msg.payload.role(), Role::Implementer);
    }
}
