//! The stage router: the single owner of component state.
//!
//! Every stage change goes through [`StageRouter::transition`], which checks
//! the edge, appends the audit record, and only then applies the change. The
//! router is synchronous; it turns worker events into the next messages to
//! send and leaves the sending to the orchestrator.

pub mod backpressure;

pub use backpressure::{Capacities, DownstreamQueue, StageQueues};

use crate::audit::{Actor, AuditLog, AuditRecord};
use crate::commit::Committer;
use crate::component::{Component, Stage};
use crate::errors::RouterError;
use crate::graph::{ComponentGraph, ExecutionMode};
use crate::retry::{BlockReason, EscalationRecord, RetryDecision, RetryManager, RetryPolicy};
use crate::worker::Role;
use crate::worker::message::{
    Assignment, Feedback, FeedbackSource, InboundMessage, InboundPayload, OutboundKind,
    OutboundMessage, OutboundPayload, TestStatus, Verdict,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A message the orchestrator must deliver to a role.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub role: Role,
    pub message: OutboundMessage,
}

pub struct StageRouter {
    graph: ComponentGraph,
    queues: StageQueues,
    retry: RetryManager,
    audit: AuditLog,
    committer: Box<dyn Committer>,
    /// Stash records in the order components were blocked
    escalations: Vec<EscalationRecord>,
    /// Records not yet collected by the orchestrator
    new_escalations: Vec<EscalationRecord>,
    /// Component -> the blocked component that made it unschedulable
    unschedulable: BTreeMap<String, String>,
    /// Component -> revision id of its commit
    commits: BTreeMap<String, String>,
}

impl StageRouter {
    pub fn new(graph: ComponentGraph, audit: AuditLog, committer: Box<dyn Committer>) -> Self {
        Self {
            graph,
            queues: StageQueues::new(Capacities::default()),
            retry: RetryManager::default(),
            audit,
            committer,
            escalations: Vec::new(),
            new_escalations: Vec::new(),
            unschedulable: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }

    pub fn with_capacities(mut self, capacities: Capacities) -> Self {
        self.queues = StageQueues::new(capacities);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryManager::new(policy);
        self
    }

    pub fn graph(&self) -> &ComponentGraph {
        &self.graph
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.graph.get(id)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    pub fn escalations(&self) -> &[EscalationRecord] {
        &self.escalations
    }

    /// Stash records created since the last call.
    pub fn take_new_escalations(&mut self) -> Vec<EscalationRecord> {
        std::mem::take(&mut self.new_escalations)
    }

    pub fn unschedulable(&self) -> &BTreeMap<String, String> {
        &self.unschedulable
    }

    pub fn commits(&self) -> &BTreeMap<String, String> {
        &self.commits
    }

    pub fn queue_depth(&self, queue: DownstreamQueue) -> usize {
        self.queues.depth(&self.graph, queue)
    }

    pub fn held(&self, queue: DownstreamQueue) -> Vec<String> {
        self.queues.held(queue)
    }

    pub fn blocked_count(&self) -> usize {
        self.graph
            .components()
            .iter()
            .filter(|c| c.stage == Stage::Blocked)
            .count()
    }

    /// No component can make further progress on its own.
    pub fn is_settled(&self) -> bool {
        self.graph
            .components()
            .iter()
            .all(|c| c.is_terminal() || self.unschedulable.contains_key(&c.id))
    }

    /// Uncommitted changes of a component, for recovery and stash records.
    pub fn snapshot_diff(&self, id: &str) -> Option<String> {
        let component = self.graph.get(id)?;
        match self.committer.snapshot_diff(component) {
            Ok(diff) => diff,
            Err(e) => {
                warn!(component = %id, error = %e, "Could not snapshot diff");
                None
            }
        }
    }

    fn component_ref(&self, id: &str) -> Result<&Component, RouterError> {
        self.graph
            .get(id)
            .ok_or_else(|| RouterError::UnknownComponent { id: id.to_string() })
    }

    fn component_mut(&mut self, id: &str) -> Result<&mut Component, RouterError> {
        self.graph
            .get_mut(id)
            .ok_or_else(|| RouterError::UnknownComponent { id: id.to_string() })
    }

    fn check_edge(&self, id: &str, to: Stage) -> Result<Stage, RouterError> {
        let from = self.component_ref(id)?.stage;
        if !from.can_transition_to(to) {
            return Err(RouterError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }
        Ok(from)
    }

    fn record(
        &mut self,
        id: &str,
        from: Stage,
        to: Stage,
        actor: Actor,
        note: String,
    ) -> Result<(), RouterError> {
        self.audit
            .append(AuditRecord::new(id, from, to, actor).with_note(note))
            .map_err(RouterError::Audit)
    }

    /// Move a component along one edge of the stage graph.
    ///
    /// The audit record is durable before the stage changes.
    pub fn transition(
        &mut self,
        id: &str,
        to: Stage,
        actor: Actor,
        note: impl Into<String>,
    ) -> Result<(), RouterError> {
        let from = self.check_edge(id, to)?;
        self.record(id, from, to, actor, note.into())?;
        self.component_mut(id)?.enter(to);
        debug!(component = %id, from = %from, to = %to, actor = %actor, "Stage transition");
        Ok(())
    }

    /// Whether every predecessor of `index` lets it start.
    ///
    /// A declared dependency must be committed. A synthetic same-file edge is
    /// also satisfied when the earlier component can never commit.
    fn is_ready(&self, index: usize) -> bool {
        let Some(component) = self.graph.component(index) else {
            return false;
        };
        self.graph.dependencies(index).iter().all(|&dep| {
            let Some(dep) = self.graph.component(dep) else {
                return false;
            };
            dep.stage == Stage::Committed
                || (!component.dependencies.contains(&dep.id)
                    && (dep.stage == Stage::Blocked || self.unschedulable.contains_key(&dep.id)))
        })
    }

    /// Start every pending component whose predecessors allow it.
    pub fn schedule(&mut self, mode: ExecutionMode) -> Result<Vec<Dispatch>, RouterError> {
        if mode == ExecutionMode::Sequential
            && self.graph.components().iter().any(|c| c.stage.is_active())
        {
            return Ok(Vec::new());
        }

        let mut ready: Vec<usize> = (0..self.graph.len())
            .filter(|&i| {
                self.graph.component(i).is_some_and(|c| {
                    c.stage == Stage::Pending && !self.unschedulable.contains_key(&c.id)
                })
            })
            .filter(|&i| self.is_ready(i))
            .collect();

        match mode {
            ExecutionMode::Sequential => ready.truncate(1),
            // roots before anything that had to wait
            ExecutionMode::Mixed => ready.sort_by_key(|&i| (!self.graph.dependencies(i).is_empty(), i)),
            ExecutionMode::FullPipeline => {}
        }

        let mut dispatches = Vec::new();
        for index in ready {
            let id = self.graph.components()[index].id.clone();
            self.transition(&id, Stage::Implementing, Actor::Router, "predecessors committed")?;
            info!(component = %id, "Component scheduled");
            dispatches.push(self.assignment(&id, OutboundKind::Assignment)?);
        }
        Ok(dispatches)
    }

    fn assignment(&self, id: &str, kind: OutboundKind) -> Result<Dispatch, RouterError> {
        let component = self.component_ref(id)?;
        let retry = kind != OutboundKind::Assignment;
        Ok(Dispatch {
            role: Role::Implementer,
            message: OutboundMessage {
                component_id: id.to_string(),
                kind,
                attempt: component.attempt,
                payload: OutboundPayload::Assignment(Assignment {
                    component_id: id.to_string(),
                    files: component.files(),
                    notes: component.notes.clone(),
                    attempt: component.attempt,
                    revision: retry,
                    feedback: if retry {
                        component.last_feedback.clone()
                    } else {
                        None
                    },
                }),
            },
        })
    }

    /// Build the message that puts a component into `queue`.
    fn downstream_request(
        &self,
        queue: DownstreamQueue,
        id: &str,
    ) -> Result<Dispatch, RouterError> {
        let component = self.component_ref(id)?;
        let unexpected = |what: &str| RouterError::UnexpectedMessage {
            id: id.to_string(),
            stage: component.stage,
            message: what.to_string(),
        };
        let payload = match queue {
            DownstreamQueue::Review => OutboundPayload::ReviewRequest {
                component_id: id.to_string(),
                handoff: component
                    .last_handoff
                    .clone()
                    .ok_or_else(|| unexpected("review request without handoff"))?,
            },
            DownstreamQueue::TestWrite => OutboundPayload::TestRequest {
                component_id: id.to_string(),
                files: component.touched_files(),
                behavior_to_test: component.behavior_to_test.clone(),
            },
            DownstreamQueue::TestRun => {
                let tests = component
                    .test_handoff
                    .as_ref()
                    .ok_or_else(|| unexpected("test execution without test handoff"))?;
                OutboundPayload::TestExecution {
                    component_id: id.to_string(),
                    test_files: tests.test_files.clone(),
                    run_command: tests.run_command.clone(),
                }
            }
        };
        Ok(Dispatch {
            role: queue.consumer(),
            message: OutboundMessage {
                component_id: id.to_string(),
                kind: OutboundKind::Assignment,
                attempt: component.attempt,
                payload,
            },
        })
    }

    /// Stage a component leaves when it enters `queue`.
    fn upstream_stage(queue: DownstreamQueue) -> Stage {
        match queue {
            DownstreamQueue::Review => Stage::Implementing,
            DownstreamQueue::TestWrite => Stage::Approved,
            DownstreamQueue::TestRun => Stage::WritingTests,
        }
    }

    /// Enqueue downstream if there is room, otherwise hold.
    fn advance_or_hold(
        &mut self,
        queue: DownstreamQueue,
        id: &str,
        actor: Actor,
    ) -> Result<Vec<Dispatch>, RouterError> {
        if !self.queues.has_room(&self.graph, queue) {
            info!(
                component = %id,
                queue = %queue,
                depth = self.queues.depth(&self.graph, queue),
                "Downstream queue full, holding"
            );
            self.queues.hold(queue, id);
            return Ok(Vec::new());
        }
        self.transition(id, queue.waiting_stage(), actor, format!("enqueued for {}", queue))?;
        Ok(vec![self.downstream_request(queue, id)?])
    }

    fn release_held(&mut self, queue: DownstreamQueue) -> Result<Vec<Dispatch>, RouterError> {
        let mut dispatches = Vec::new();
        while self.queues.has_room(&self.graph, queue) {
            let Some(id) = self.queues.release_next(queue) else {
                break;
            };
            // a held component is parked in the upstream stage
            if self.component_ref(&id)?.stage != Self::upstream_stage(queue) {
                continue;
            }
            info!(component = %id, queue = %queue, "Released from hold");
            dispatches.extend(self.advance_or_hold(queue, &id, Actor::Router)?);
        }
        Ok(dispatches)
    }

    /// A worker took an item off its queue.
    pub fn on_dequeued(&mut self, role: Role, id: &str) -> Result<Vec<Dispatch>, RouterError> {
        let Some(queue) = DownstreamQueue::for_consumer(role) else {
            return Ok(Vec::new());
        };
        let active = match queue {
            DownstreamQueue::Review => Stage::Reviewing,
            DownstreamQueue::TestWrite => Stage::WritingTests,
            DownstreamQueue::TestRun => Stage::Running,
        };
        let stage = self.component_ref(id)?.stage;
        if stage == active {
            // redelivered after a worker recovery
            return Ok(Vec::new());
        }
        if stage != queue.waiting_stage() {
            return Err(RouterError::UnexpectedMessage {
                id: id.to_string(),
                stage,
                message: format!("dequeue by {}", role),
            });
        }
        self.transition(id, active, Actor::Worker(role), "dequeued")?;
        self.release_held(queue)
    }

    /// Apply a worker result and return the messages it triggers.
    pub fn on_message(
        &mut self,
        role: Role,
        message: InboundMessage,
    ) -> Result<Vec<Dispatch>, RouterError> {
        let id = message.component_id.clone();
        let stage = self.component_ref(&id)?.stage;
        let label = format!("{} from {}", message.payload.name(), role);
        let unexpected = || RouterError::UnexpectedMessage {
            id: id.clone(),
            stage,
            message: label.clone(),
        };

        match (&message.payload, stage) {
            (InboundPayload::Handoff(_), Stage::Implementing) if !self.queues.is_held(&id) => {}
            (InboundPayload::ReviewResult { .. }, Stage::Reviewing) => {}
            (InboundPayload::TestHandoff(_), Stage::WritingTests) if !self.queues.is_held(&id) => {}
            (InboundPayload::TestResult { .. }, Stage::Running) => {}
            _ => return Err(unexpected()),
        }

        let actor = Actor::Worker(role);
        match message.payload {
            InboundPayload::Handoff(handoff) => {
                info!(component = %id, summary = %handoff.summary, "Implementation handed off");
                self.component_mut(&id)?.last_handoff = Some(handoff);
                self.advance_or_hold(DownstreamQueue::Review, &id, actor)
            }
            InboundPayload::ReviewResult {
                verdict: Verdict::Approved,
                ..
            } => {
                self.transition(&id, Stage::Approved, actor, "approved")?;
                self.advance_or_hold(DownstreamQueue::TestWrite, &id, Actor::Router)
            }
            InboundPayload::ReviewResult {
                verdict: Verdict::Rejected,
                issues,
                ..
            } => {
                self.transition(&id, Stage::Rejected, actor, issues.join("; "))?;
                let component = self.component_mut(&id)?;
                component.rejection_count += 1;
                component.last_feedback = Some(Feedback {
                    source: FeedbackSource::Review,
                    issues,
                });
                warn!(component = %id, rejections = component.rejection_count, "Review rejected");
                let decision = self.retry.on_rejection(self.component_ref(&id)?);
                self.retry_or_block(&id, decision, OutboundKind::Revision)
            }
            InboundPayload::TestHandoff(tests) => {
                info!(component = %id, tests = tests.test_count, "Tests written");
                self.component_mut(&id)?.test_handoff = Some(tests);
                self.advance_or_hold(DownstreamQueue::TestRun, &id, actor)
            }
            InboundPayload::TestResult {
                status: TestStatus::Pass,
                ..
            } => {
                self.transition(&id, Stage::Passed, actor, "tests passed")?;
                self.commit(&id)?;
                Ok(Vec::new())
            }
            InboundPayload::TestResult {
                status: TestStatus::Fail,
                failures,
                ..
            } => {
                self.transition(&id, Stage::Failed, actor, failures.join("; "))?;
                let component = self.component_mut(&id)?;
                component.test_failure_count += 1;
                component.last_feedback = Some(Feedback {
                    source: FeedbackSource::Tests,
                    issues: failures,
                });
                warn!(component = %id, failures = component.test_failure_count, "Tests failed");
                let decision = self.retry.on_test_failure(self.component_ref(&id)?);
                self.retry_or_block(&id, decision, OutboundKind::Fix)
            }
            InboundPayload::Failure { .. } => Err(unexpected()),
        }
    }

    fn retry_or_block(
        &mut self,
        id: &str,
        decision: RetryDecision,
        kind: OutboundKind,
    ) -> Result<Vec<Dispatch>, RouterError> {
        let component = self.component_ref(id)?;
        match decision {
            RetryDecision::Retry => {
                let note = format!("retry as attempt {}", component.attempt + 1);
                self.transition(id, Stage::Implementing, Actor::RetryManager, note)?;
                Ok(vec![self.assignment(id, kind)?])
            }
            RetryDecision::Exhausted => {
                let reason = match kind {
                    OutboundKind::Fix => BlockReason::TestBudgetExhausted {
                        failures: component.test_failure_count,
                    },
                    _ => BlockReason::RejectionBudgetExhausted {
                        rejections: component.rejection_count,
                    },
                };
                self.block(id, reason, Actor::RetryManager)?;
                Ok(Vec::new())
            }
        }
    }

    /// `Passed -> Committed`, the only place a commit happens.
    fn commit(&mut self, id: &str) -> Result<(), RouterError> {
        let from = self.check_edge(id, Stage::Committed)?;
        self.record(
            id,
            from,
            Stage::Committed,
            Actor::Committer,
            "commit requested".into(),
        )?;

        let Some(component) = self.graph.get(id) else {
            return Err(RouterError::UnknownComponent { id: id.to_string() });
        };
        match self.committer.commit(component) {
            Ok(revision) => {
                self.component_mut(id)?.enter(Stage::Committed);
                info!(component = %id, revision = %revision, "Component committed");
                self.commits.insert(id.to_string(), revision);
            }
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(component = %id, error = %error, "Commit failed");
                self.block(id, BlockReason::CommitFailed { error }, Actor::Committer)?;
            }
        }
        Ok(())
    }

    /// Terminal failure: stash, block, and mark declared dependents
    /// unschedulable.
    fn block(&mut self, id: &str, reason: BlockReason, actor: Actor) -> Result<(), RouterError> {
        let diff = self.snapshot_diff(id);
        self.transition(id, Stage::Blocked, actor, reason.to_string())?;
        let record = self.retry.stash(self.component_ref(id)?, reason, diff);
        warn!(component = %id, reason = %record.reason, "Component blocked");
        self.escalations.push(record.clone());
        self.new_escalations.push(record);

        for dependent in self.graph.transitive_dependents(id) {
            let pending = self
                .graph
                .get(&dependent)
                .is_some_and(|c| c.stage == Stage::Pending);
            if pending && !self.unschedulable.contains_key(&dependent) {
                warn!(component = %dependent, blocked_by = %id, "Component unschedulable");
                self.unschedulable.insert(dependent, id.to_string());
            }
        }
        Ok(())
    }
}
