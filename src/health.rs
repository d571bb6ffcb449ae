//! Health monitoring for worker proxies.
//!
//! The monitor never talks to a proxy itself. Each cycle it looks at the
//! proxies' health reports and returns the actions the orchestrator should
//! take: probe a silent worker, replace it, escalate a role that keeps
//! failing, or recycle an idle worker whose turn count has grown too large.
//! Time is measured in monitoring cycles, not wall-clock deadlines.

use crate::worker::message::HandoffRequest;
use crate::worker::{HealthReport, Role, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Turn counts above which an idle worker is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecycleThresholds {
    pub implementer: u32,
    pub reviewer: u32,
    pub test_writer: u32,
    pub test_runner: u32,
}

impl Default for RecycleThresholds {
    fn default() -> Self {
        Self {
            implementer: 40,
            reviewer: 60,
            test_writer: 40,
            test_runner: 80,
        }
    }
}

impl RecycleThresholds {
    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::Implementer => self.implementer,
            Role::Reviewer => self.reviewer,
            Role::TestWriter => self.test_writer,
            Role::TestRunner => self.test_runner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Silent cycles before a status probe
    pub probe_after_cycles: u32,
    /// Silent cycles before the worker is replaced
    pub recover_after_cycles: u32,
    /// Failures of one role in a run before recovery stops
    pub max_silent_failures: u32,
    pub recycle_thresholds: RecycleThresholds,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            probe_after_cycles: 1,
            recover_after_cycles: 2,
            max_silent_failures: 2,
            recycle_thresholds: RecycleThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    Probe {
        role: Role,
    },
    /// Replace the live instance; its in-flight item is redelivered.
    Recover {
        role: Role,
        reason: String,
        failure_number: u32,
    },
    /// Stop recovering this role and ask the caller what to do.
    Escalate {
        role: Role,
        failures: u32,
        reason: String,
    },
    RequestHandoff(HandoffRequest),
}

#[derive(Debug, Default)]
struct RoleHealth {
    silent_cycles: u32,
    probed: bool,
    failures: u32,
    handoff_requested: bool,
    halted: bool,
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    roles: HashMap<Role, RoleHealth>,
    recycles: u32,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            roles: HashMap::new(),
            recycles: 0,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    fn state(&mut self, role: Role) -> &mut RoleHealth {
        self.roles.entry(role).or_default()
    }

    /// The worker made progress: it dequeued, answered, or produced output.
    pub fn observe_activity(&mut self, role: Role) {
        let state = self.state(role);
        state.silent_cycles = 0;
        state.probed = false;
    }

    /// The instance was swapped after a handoff summary.
    pub fn observe_recycled(&mut self, role: Role) {
        self.observe_activity(role);
        self.state(role).handoff_requested = false;
        self.recycles += 1;
    }

    /// The proxy refused a handoff request because work arrived first.
    pub fn handoff_refused(&mut self, role: Role) {
        self.state(role).handoff_requested = false;
    }

    /// Count a failure of `role` and decide between recovery and escalation.
    pub fn register_failure(&mut self, role: Role, reason: &str) -> HealthAction {
        let max = self.policy.max_silent_failures;
        let state = self.state(role);
        state.silent_cycles = 0;
        state.probed = false;
        state.handoff_requested = false;
        state.failures += 1;
        let failures = state.failures;

        if failures >= max {
            state.halted = true;
            warn!(role = %role, failures, reason = %reason, "Worker failed repeatedly, escalating");
            HealthAction::Escalate {
                role,
                failures,
                reason: reason.to_string(),
            }
        } else {
            warn!(role = %role, failure = failures, reason = %reason, "Worker failed, recovering");
            HealthAction::Recover {
                role,
                reason: reason.to_string(),
                failure_number: failures,
            }
        }
    }

    pub fn is_halted(&self, role: Role) -> bool {
        self.roles.get(&role).is_some_and(|s| s.halted)
    }

    pub fn failures(&self, role: Role) -> u32 {
        self.roles.get(&role).map(|s| s.failures).unwrap_or(0)
    }

    pub fn recycles(&self) -> u32 {
        self.recycles
    }

    /// Run one monitoring cycle over the given reports.
    pub fn tick(&mut self, reports: &[HealthReport]) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        for report in reports {
            let role = report.role;
            if self.is_halted(role) || report.status == WorkerStatus::Dead {
                continue;
            }

            if !report.is_busy() {
                let state = self.state(role);
                state.silent_cycles = 0;
                state.probed = false;
                if let Some(action) = self.check_recycle(report) {
                    actions.push(action);
                }
                continue;
            }

            let policy = self.policy;
            let state = self.state(role);
            state.silent_cycles += 1;
            let silent = state.silent_cycles;
            debug!(role = %role, silent_cycles = silent, "Worker silent this cycle");

            if silent >= policy.recover_after_cycles {
                let reason = match &report.in_flight {
                    Some(id) => format!("no progress on {} for {} cycles", id, silent),
                    None => format!("no progress for {} cycles", silent),
                };
                actions.push(self.register_failure(role, &reason));
            } else if silent >= policy.probe_after_cycles && !state.probed {
                state.probed = true;
                actions.push(HealthAction::Probe { role });
            }
        }
        actions
    }

    /// Recycle only between items: idle, nothing queued, over threshold.
    fn check_recycle(&mut self, report: &HealthReport) -> Option<HealthAction> {
        let threshold = self.policy.recycle_thresholds.get(report.role);
        let state = self.state(report.role);
        if report.status != WorkerStatus::Idle
            || report.queue_depth > 0
            || report.turn_count <= threshold
            || state.handoff_requested
        {
            return None;
        }
        state.handoff_requested = true;
        info!(
            role = %report.role,
            turns = report.turn_count,
            threshold,
            "Turn threshold crossed, requesting handoff"
        );
        Some(HealthAction::RequestHandoff(HandoffRequest {
            role: report.role,
            reason: format!(
                "turn count {} exceeds threshold {}",
                report.turn_count, threshold
            ),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn report(role: Role, status: WorkerStatus, turns: u32, in_flight: Option<&str>) -> HealthReport {
        HealthReport {
            role,
            status,
            turn_count: turns,
            queue_depth: 0,
            in_flight: in_flight.map(String::from),
            last_seen: Utc::now(),
            probe_pending: false,
        }
    }

    fn busy(role: Role) -> HealthReport {
        report(role, WorkerStatus::Active, 3, Some("x"))
    }

    #[test]
    fn test_probe_then_recover() {
        let mut monitor = HealthMonitor::default();
        assert_eq!(
            monitor.tick(&[busy(Role::Reviewer)]),
            vec![HealthAction::Probe {
                role: Role::Reviewer
            }]
        );
        let actions = monitor.tick(&[busy(Role::Reviewer)]);
        assert!(matches!(
            &actions[..],
            [HealthAction::Recover {
                role: Role::Reviewer,
                failure_number: 1,
                ..
            }]
        ));
        assert_eq!(monitor.failures(Role::Reviewer), 1);
    }

    #[test]
    fn test_activity_resets_silence() {
        let mut monitor = HealthMonitor::default();
        monitor.tick(&[busy(Role::Implementer)]);
        monitor.observe_activity(Role::Implementer);
        let actions = monitor.tick(&[busy(Role::Implementer)]);
        assert_eq!(
            actions,
            vec![HealthAction::Probe {
                role: Role::Implementer
            }]
        );
    }

    #[test]
    fn test_second_failure_of_same_role_escalates() {
        let mut monitor = HealthMonitor::default();
        assert!(matches!(
            monitor.register_failure(Role::TestRunner, "crashed"),
            HealthAction::Recover { .. }
        ));
        // a different role has its own budget
        assert!(matches!(
            monitor.register_failure(Role::Reviewer, "crashed"),
            HealthAction::Recover { .. }
        ));
        assert!(matches!(
            monitor.register_failure(Role::TestRunner, "crashed again"),
            HealthAction::Escalate { failures: 2, .. }
        ));
        assert!(monitor.is_halted(Role::TestRunner));
        assert!(!monitor.is_halted(Role::Reviewer));
        assert!(monitor.tick(&[busy(Role::TestRunner)]).is_empty());
    }

    #[test]
    fn test_idle_worker_over_threshold_is_recycled_once() {
        let mut monitor = HealthMonitor::default();
        let idle = report(Role::Implementer, WorkerStatus::Idle, 41, None);
        let actions = monitor.tick(std::slice::from_ref(&idle));
        assert!(matches!(
            &actions[..],
            [HealthAction::RequestHandoff(HandoffRequest {
                role: Role::Implementer,
                ..
            })]
        ));
        assert!(monitor.tick(std::slice::from_ref(&idle)).is_empty());

        monitor.observe_recycled(Role::Implementer);
        assert_eq!(monitor.recycles(), 1);
        let fresh = report(Role::Implementer, WorkerStatus::Idle, 0, None);
        assert!(monitor.tick(&[fresh]).is_empty());
    }

    #[test]
    fn test_never_recycles_mid_work() {
        let mut monitor = HealthMonitor::default();
        let mut working = report(Role::Implementer, WorkerStatus::Active, 90, Some("a"));
        assert!(
            !monitor
                .tick(std::slice::from_ref(&working))
                .iter()
                .any(|a| matches!(a, HealthAction::RequestHandoff(_)))
        );

        working.status = WorkerStatus::Idle;
        working.in_flight = None;
        working.queue_depth = 1;
        assert!(monitor.tick(&[working]).is_empty());
    }

    #[test]
    fn test_thresholds_per_role() {
        let mut monitor = HealthMonitor::default();
        let reviewer = report(Role::Reviewer, WorkerStatus::Idle, 50, None);
        assert!(monitor.tick(&[reviewer]).is_empty());
        let runner = report(Role::TestRunner, WorkerStatus::Idle, 81, None);
        assert_eq!(monitor.tick(&[runner]).len(), 1);
    }

    #[test]
    fn test_refused_handoff_can_be_requested_again() {
        let mut monitor = HealthMonitor::default();
        let idle = report(Role::TestWriter, WorkerStatus::Idle, 45, None);
        assert_eq!(monitor.tick(std::slice::from_ref(&idle)).len(), 1);
        monitor.handoff_refused(Role::TestWriter);
        assert_eq!(monitor.tick(&[idle]).len(), 1);
    }
}
