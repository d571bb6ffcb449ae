//! The run loop that connects worker proxies, the stage router and the
//! health monitor.
//!
//! The loop is single-threaded over shared state: it polls every proxy,
//! feeds what it sees to the router, delivers the router's messages, and
//! schedules ready components. Once per monitoring interval it asks the
//! health monitor what to do about silent or overgrown workers.

pub mod report;

pub use report::{ComponentOutcome, ComponentReport, RunReport};

use crate::audit::AuditLog;
use crate::commit::Committer;
use crate::errors::{OrchestratorError, RouterError};
use crate::graph::{ComponentGraph, ExecutionMode, ModeRequest};
use crate::health::{HealthAction, HealthMonitor, HealthPolicy};
use crate::retry::{EscalationRecord, RetryPolicy};
use crate::router::{Capacities, Dispatch, StageRouter};
use crate::worker::message::InboundPayload;
use crate::worker::{
    BackendFactory, ChannelWorker, ProbeOutcome, ProxyEvent, RecoveryContext, Role, WorkerProxy,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: ModeRequest,
    pub capacities: Capacities,
    pub retry: RetryPolicy,
    pub health: HealthPolicy,
    /// Sleep between polls when nothing happened
    pub poll_interval: Duration,
    /// Length of one health monitoring cycle
    pub monitor_interval: Duration,
    /// Scheduling stops once more than this share of components is blocked
    pub blocked_fraction: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ModeRequest::Auto,
            capacities: Capacities::default(),
            retry: RetryPolicy::default(),
            health: HealthPolicy::default(),
            poll_interval: Duration::from_millis(50),
            monitor_interval: Duration::from_secs(60),
            blocked_fraction: 0.5,
        }
    }
}

/// Something the caller has to know about, and possibly decide on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationEvent {
    /// A role failed silently too often. It is halted; `stranded` lists the
    /// work it was holding.
    RepeatedSilentFailure {
        role: Role,
        failures: u32,
        reason: String,
        stranded: Vec<String>,
    },
    /// Too many components are blocked; no new components will start.
    MajorityBlocked { blocked: usize, total: usize },
    ComponentBlocked { record: Box<EscalationRecord> },
}

/// A worker replacement performed during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub role: Role,
    pub reason: String,
    pub failure_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    router: StageRouter,
    /// One live proxy per role, in `Role::ALL` order
    proxies: Vec<Box<dyn WorkerProxy>>,
    monitor: HealthMonitor,
    mode: ExecutionMode,
    escalation_tx: Option<mpsc::UnboundedSender<EscalationEvent>>,
    escalations: Vec<EscalationEvent>,
    recoveries: Vec<RecoveryRecord>,
    scheduling_halted: bool,
}

impl Orchestrator {
    pub fn new(
        graph: ComponentGraph,
        mut proxies: Vec<Box<dyn WorkerProxy>>,
        audit: AuditLog,
        committer: Box<dyn Committer>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        for role in Role::ALL {
            if !proxies.iter().any(|p| p.role() == role) {
                return Err(OrchestratorError::WorkerMissing { role });
            }
        }
        proxies.sort_by_key(|p| p.role());
        proxies.dedup_by_key(|p| p.role());

        let mode = graph.select_mode(config.mode);
        let router = StageRouter::new(graph, audit, committer)
            .with_capacities(config.capacities)
            .with_retry_policy(config.retry);

        Ok(Self {
            monitor: HealthMonitor::new(config.health),
            config,
            router,
            proxies,
            mode,
            escalation_tx: None,
            escalations: Vec::new(),
            recoveries: Vec::new(),
            scheduling_halted: false,
        })
    }

    /// Build with one [`ChannelWorker`] per role. Must be called inside a
    /// tokio runtime.
    pub fn with_channel_workers(
        graph: ComponentGraph,
        factory: Arc<dyn BackendFactory>,
        audit: AuditLog,
        committer: Box<dyn Committer>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let proxies = Role::ALL
            .into_iter()
            .map(|role| Box::new(ChannelWorker::new(role, factory.clone())) as Box<dyn WorkerProxy>)
            .collect();
        Self::new(graph, proxies, audit, committer, config)
    }

    /// Receive escalation events as they happen.
    pub fn with_escalation_channel(mut self, tx: mpsc::UnboundedSender<EscalationEvent>) -> Self {
        self.escalation_tx = Some(tx);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn router(&self) -> &StageRouter {
        &self.router
    }

    fn proxy_mut(&mut self, role: Role) -> &mut dyn WorkerProxy {
        // proxies are sorted by role and one per role
        let index = Role::ALL.iter().position(|r| *r == role).unwrap_or(0);
        self.proxies[index].as_mut()
    }

    /// Drive the pipeline until nothing else can move.
    pub async fn run(mut self) -> Result<RunReport, OrchestratorError> {
        info!(
            mode = %self.mode,
            components = self.router.graph().len(),
            "Starting pipeline run"
        );
        let mut last_cycle = Instant::now();

        loop {
            let mut progressed = self.drain_events()?;
            // blocks from this round decide whether anything new may start
            self.collect_blocks();

            if !self.scheduling_halted {
                let dispatches = self.router.schedule(self.mode)?;
                progressed |= !dispatches.is_empty();
                self.dispatch(dispatches);
            }

            if self.router.is_settled() {
                info!("All components settled");
                break;
            }
            if !progressed && self.is_stalled() {
                warn!("No component can make further progress, ending run");
                break;
            }

            if last_cycle.elapsed() >= self.config.monitor_interval {
                self.monitor_cycle();
                last_cycle = Instant::now();
            }

            if progressed {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        for proxy in &mut self.proxies {
            proxy.shutdown();
        }

        let report = RunReport::from_router(
            &self.router,
            self.mode,
            self.monitor.recycles(),
            std::mem::take(&mut self.recoveries),
            std::mem::take(&mut self.escalations),
        );
        if let Some(path) = self
            .router
            .audit_mut()
            .finish_run(&report)
            .map_err(OrchestratorError::Other)?
        {
            debug!(path = %path.display(), "Run summary written");
        }
        info!(
            committed = report.committed().len(),
            blocked = report.blocked().len(),
            unschedulable = report.unschedulable().len(),
            stalled = report.stalled().len(),
            "Pipeline run finished"
        );
        Ok(report)
    }

    /// Poll every proxy dry and route what came back.
    fn drain_events(&mut self) -> Result<bool, OrchestratorError> {
        let mut progressed = false;
        for role in Role::ALL {
            while let Some(event) = self.proxy_mut(role).poll() {
                progressed = true;
                self.handle_event(role, event)?;
            }
        }
        Ok(progressed)
    }

    fn handle_event(&mut self, role: Role, event: ProxyEvent) -> Result<(), OrchestratorError> {
        match event {
            ProxyEvent::Dequeued(id) => {
                self.monitor.observe_activity(role);
                let dispatches = Self::route(self.router.on_dequeued(role, &id))?;
                self.dispatch(dispatches);
            }
            ProxyEvent::Message(message) => {
                self.monitor.observe_activity(role);
                if let InboundPayload::Failure { reason } = &message.payload {
                    warn!(role = %role, component = %message.component_id, reason = %reason, "Worker reported failure");
                    let action = self.monitor.register_failure(role, reason);
                    self.apply(action);
                    return Ok(());
                }
                debug!(role = %role, message = %message, turns = message.turn_count, "Worker result");
                let dispatches = Self::route(self.router.on_message(role, message))?;
                self.dispatch(dispatches);
            }
            ProxyEvent::Recycled(summary) => {
                info!(role = %role, completed = summary.completed_work.len(), "Worker recycled");
                self.monitor.observe_recycled(role);
            }
            ProxyEvent::ProbeAnswered => {
                debug!(role = %role, "Probe answered");
                self.monitor.observe_activity(role);
            }
        }
        Ok(())
    }

    /// A worker that says something out of turn is ignored; the component
    /// shows up as stalled if nothing else moves it.
    fn route(
        result: Result<Vec<Dispatch>, RouterError>,
    ) -> Result<Vec<Dispatch>, OrchestratorError> {
        match result {
            Ok(dispatches) => Ok(dispatches),
            Err(e @ (RouterError::UnexpectedMessage { .. } | RouterError::UnknownComponent { .. })) => {
                warn!(error = %e, "Dropping worker event");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&mut self, dispatches: Vec<Dispatch>) {
        for Dispatch { role, message } in dispatches {
            debug!(role = %role, component = %message.component_id, kind = ?message.kind, "Dispatching");
            self.proxy_mut(role).assign(message);
        }
    }

    fn emit(&mut self, event: EscalationEvent) {
        if let Some(tx) = &self.escalation_tx
            && tx.send(event.clone()).is_err()
        {
            debug!("Escalation subscriber went away");
        }
        self.escalations.push(event);
    }

    /// Report newly blocked components and stop scheduling when too many are.
    fn collect_blocks(&mut self) {
        for record in self.router.take_new_escalations() {
            self.emit(EscalationEvent::ComponentBlocked {
                record: Box::new(record),
            });
        }

        if self.scheduling_halted {
            return;
        }
        let total = self.router.graph().len();
        let blocked = self.router.blocked_count();
        if total > 0 && blocked as f64 / total as f64 > self.config.blocked_fraction {
            error!(blocked, total, "Majority of components blocked, no new components will start");
            self.scheduling_halted = true;
            self.emit(EscalationEvent::MajorityBlocked { blocked, total });
        }
    }

    /// Every live worker is idle with nothing queued, so only a decision from
    /// outside could move the remaining components.
    fn is_stalled(&self) -> bool {
        self.proxies.iter().all(|p| {
            if self.monitor.is_halted(p.role()) {
                return true;
            }
            let health = p.health();
            !health.is_busy() && health.queue_depth == 0
        })
    }

    fn monitor_cycle(&mut self) {
        let reports: Vec<_> = self
            .proxies
            .iter()
            .filter(|p| !self.monitor.is_halted(p.role()))
            .map(|p| p.health())
            .collect();
        for action in self.monitor.tick(&reports) {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: HealthAction) {
        let mut actions = VecDeque::from([action]);
        while let Some(action) = actions.pop_front() {
            match action {
                HealthAction::Probe { role } => {
                    debug!(role = %role, "Probing silent worker");
                    if self.proxy_mut(role).probe() == ProbeOutcome::Dead {
                        actions.push_back(self.monitor.register_failure(role, "worker instance is gone"));
                    }
                }
                HealthAction::Recover {
                    role,
                    reason,
                    failure_number,
                } => self.recover(role, reason, failure_number),
                HealthAction::Escalate {
                    role,
                    failures,
                    reason,
                } => {
                    let proxy = self.proxy_mut(role);
                    proxy.halt();
                    let stranded = proxy.queued();
                    error!(
                        role = %role,
                        failures,
                        stranded = ?stranded,
                        "Worker keeps failing, automatic recovery stopped"
                    );
                    self.emit(EscalationEvent::RepeatedSilentFailure {
                        role,
                        failures,
                        reason,
                        stranded,
                    });
                }
                HealthAction::RequestHandoff(request) => {
                    let role = request.role;
                    if !self.proxy_mut(role).request_handoff(request) {
                        debug!(role = %role, "Handoff refused, worker picked up work");
                        self.monitor.handoff_refused(role);
                    }
                }
            }
        }
    }

    fn recover(&mut self, role: Role, reason: String, failure_number: u32) {
        let snapshot = self.proxy_mut(role).snapshot();
        let diff = snapshot
            .in_flight
            .as_deref()
            .and_then(|id| self.router.snapshot_diff(id));
        warn!(
            role = %role,
            failure = failure_number,
            in_flight = ?snapshot.in_flight,
            queued = snapshot.queued.len(),
            "Replacing worker instance"
        );
        self.recoveries.push(RecoveryRecord {
            role,
            reason: reason.clone(),
            failure_number,
            in_flight: snapshot.in_flight.clone(),
        });
        let context = RecoveryContext {
            role,
            reason,
            failure_number,
            snapshot,
            diff,
        };
        self.proxy_mut(role).recover(context);
    }
}
