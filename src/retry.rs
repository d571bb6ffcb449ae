//! Retry budgets and the stash record written when a component is blocked.
//!
//! Rejections and test failures are tracked by independent counters. Once a
//! counter reaches its limit the component is blocked for good and an
//! [`EscalationRecord`] captures what was on disk and why.

use crate::component::Component;
use crate::worker::message::Feedback;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_MAX_REJECTIONS: u32 = 3;
pub const DEFAULT_MAX_TEST_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_rejections: u32,
    pub max_test_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rejections: DEFAULT_MAX_REJECTIONS,
            max_test_failures: DEFAULT_MAX_TEST_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the component back to the implementer.
    Retry,
    /// Budget used up; block the component.
    Exhausted,
}

/// Why a component ended up blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    RejectionBudgetExhausted { rejections: u32 },
    TestBudgetExhausted { failures: u32 },
    CommitFailed { error: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::RejectionBudgetExhausted { rejections } => {
                write!(f, "rejected {} times by review", rejections)
            }
            BlockReason::TestBudgetExhausted { failures } => {
                write!(f, "tests failed {} times", failures)
            }
            BlockReason::CommitFailed { error } => write!(f, "commit failed: {}", error),
        }
    }
}

/// Stash-and-continue record for a blocked component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub component_id: String,
    pub reason: BlockReason,
    pub rejection_count: u32,
    pub test_failure_count: u32,
    pub attempt: u32,
    /// Files the last handoff touched
    pub files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<Feedback>,
    /// Uncommitted changes captured at the time of blocking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// What a human needs to do to unblock it
    pub resolution_note: String,
    pub created_at: DateTime<Utc>,
}

/// Tracks retry budgets per component and builds stash records.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Decide after `rejection_count` was incremented.
    pub fn on_rejection(&self, component: &Component) -> RetryDecision {
        if component.rejection_count >= self.policy.max_rejections {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry
        }
    }

    /// Decide after `test_failure_count` was incremented.
    pub fn on_test_failure(&self, component: &Component) -> RetryDecision {
        if component.test_failure_count >= self.policy.max_test_failures {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry
        }
    }

    pub fn stash(
        &self,
        component: &Component,
        reason: BlockReason,
        diff: Option<String>,
    ) -> EscalationRecord {
        let resolution_note = match &reason {
            BlockReason::RejectionBudgetExhausted { .. } => format!(
                "Review rejected {} {} times. Address the last review issues by hand, then re-run it.",
                component.id, component.rejection_count
            ),
            BlockReason::TestBudgetExhausted { .. } => format!(
                "Tests for {} failed {} times. Fix the failures listed below by hand, then re-run it.",
                component.id, component.test_failure_count
            ),
            BlockReason::CommitFailed { .. } => format!(
                "{} passed its tests but could not be committed. Commit the files manually.",
                component.id
            ),
        };

        EscalationRecord {
            component_id: component.id.clone(),
            reason,
            rejection_count: component.rejection_count,
            test_failure_count: component.test_failure_count,
            attempt: component.attempt,
            files: component.touched_files(),
            last_feedback: component.last_feedback.clone(),
            diff,
            resolution_note,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::message::FeedbackSource;

    #[test]
    fn test_rejection_budget() {
        let manager = RetryManager::default();
        let mut component = Component::new("x");
        for count in 1..=2 {
            component.rejection_count = count;
            assert_eq!(manager.on_rejection(&component), RetryDecision::Retry);
        }
        component.rejection_count = 3;
        assert_eq!(manager.on_rejection(&component), RetryDecision::Exhausted);
    }

    #[test]
    fn test_counters_are_independent() {
        let manager = RetryManager::default();
        let mut component = Component::new("x");
        component.rejection_count = 2;
        component.test_failure_count = 1;
        assert_eq!(manager.on_rejection(&component), RetryDecision::Retry);
        assert_eq!(manager.on_test_failure(&component), RetryDecision::Retry);

        component.test_failure_count = 2;
        assert_eq!(manager.on_test_failure(&component), RetryDecision::Exhausted);
        assert_eq!(manager.on_rejection(&component), RetryDecision::Retry);
    }

    #[test]
    fn test_custom_policy() {
        let manager = RetryManager::new(RetryPolicy {
            max_rejections: 1,
            max_test_failures: 5,
        });
        let mut component = Component::new("x");
        component.rejection_count = 1;
        assert_eq!(manager.on_rejection(&component), RetryDecision::Exhausted);
    }

    #[test]
    fn test_stash_captures_feedback_and_note() {
        let manager = RetryManager::default();
        let mut component = Component::new("x").creates("src/x.rs");
        component.rejection_count = 3;
        component.attempt = 3;
        component.last_feedback = Some(Feedback {
            source: FeedbackSource::Review,
            issues: vec!["unsafe unwrap".into()],
        });

        let record = manager.stash(
            &component,
            BlockReason::RejectionBudgetExhausted { rejections: 3 },
            Some("diff --git a/src/x.rs b/src/x.rs".into()),
        );
        assert_eq!(record.rejection_count, 3);
        assert_eq!(record.files, vec![PathBuf::from("src/x.rs")]);
        assert!(record.resolution_note.contains("3 times"));
        assert!(record.last_feedback.is_some());
        assert_eq!(record.reason.to_string(), "rejected 3 times by review");
    }
}
