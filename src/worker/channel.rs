//! Channel-backed worker proxy.
//!
//! Each live instance is a tokio task driving a [`WorkerBackend`], fed
//! through an unbounded mpsc channel. The proxy itself owns the FIFO queue
//! and the single in-flight item, so swapping the instance (recycle or
//! recovery) never loses or duplicates work.
//!
//! Status probes are answered by the instance task while an item is still
//! being processed. A slow worker therefore stays healthy; only a backend
//! that clears its [`Liveness`] flag goes unanswered.

use super::message::{HandoffRequest, HandoffSummary, InboundMessage, OutboundMessage};
use super::{
    HealthReport, ProbeOutcome, ProxyEvent, RecoveryContext, Role, WorkerProxy, WorkerStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The thing that actually does a role's work.
#[async_trait]
pub trait WorkerBackend: Send {
    /// Process one item and return the worker's result.
    async fn process(&mut self, message: OutboundMessage) -> Result<InboundMessage>;

    /// Summarise accumulated context ahead of a recycle.
    async fn summarize(&mut self, request: HandoffRequest) -> Result<HandoffSummary>;

    /// Flag consulted when a probe arrives. The default is always responsive.
    fn liveness(&self) -> Liveness {
        Liveness::default()
    }
}

/// Whether a backend can still answer a status probe.
///
/// Cloned handles share one flag, so a backend can mark itself wedged from
/// inside `process` while the instance task reads it.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Default for Liveness {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Liveness {
    pub fn is_responsive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.0.store(responsive, Ordering::Release);
    }
}

/// How a new instance came to be.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpawnContext {
    Fresh,
    Recycled { summary: HandoffSummary },
    Recovery { context: RecoveryContext },
}

impl SpawnContext {
    pub fn name(&self) -> &'static str {
        match self {
            SpawnContext::Fresh => "fresh",
            SpawnContext::Recycled { .. } => "recycled",
            SpawnContext::Recovery { .. } => "recovery",
        }
    }
}

/// Creates backends for a role.
pub trait BackendFactory: Send + Sync {
    fn spawn(&self, role: Role, context: SpawnContext) -> Box<dyn WorkerBackend>;
}

enum Envelope {
    Work(OutboundMessage),
    Handoff(HandoffRequest),
    Probe,
}

enum InstanceEvent {
    Completed(InboundMessage),
    Failed { component_id: String, error: String },
    Summary(HandoffSummary),
    SummaryFailed(String),
    Alive,
}

/// One live backend task and its channels.
struct Instance {
    work: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedReceiver<InstanceEvent>,
    handle: JoinHandle<()>,
}

impl Instance {
    fn spawn(backend: Box<dyn WorkerBackend>) -> Self {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_instance(backend, work_rx, event_tx));
        Self {
            work: work_tx,
            events: event_rx,
            handle,
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_instance(
    mut backend: Box<dyn WorkerBackend>,
    mut work: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<InstanceEvent>,
) {
    let liveness = backend.liveness();
    let mut backlog = VecDeque::new();
    loop {
        let envelope = match backlog.pop_front() {
            Some(envelope) => envelope,
            None => match work.recv().await {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let event = match envelope {
            Envelope::Work(message) => {
                let component_id = message.component_id.clone();
                let processing = backend.process(message);
                let Some(result) =
                    answer_probes_until(processing, &mut work, &events, &liveness, &mut backlog)
                        .await
                else {
                    break;
                };
                match result {
                    Ok(inbound) => InstanceEvent::Completed(inbound),
                    Err(e) => InstanceEvent::Failed {
                        component_id,
                        error: format!("{:#}", e),
                    },
                }
            }
            Envelope::Handoff(request) => match backend.summarize(request).await {
                Ok(summary) => InstanceEvent::Summary(summary),
                Err(e) => InstanceEvent::SummaryFailed(format!("{:#}", e)),
            },
            Envelope::Probe if liveness.is_responsive() => InstanceEvent::Alive,
            Envelope::Probe => continue,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Drive `processing` to completion while answering probes that arrive in
/// the meantime. Anything else received is kept in `backlog` for later.
/// Returns `None` once the proxy has dropped its event receiver.
async fn answer_probes_until<F: Future<Output = Result<InboundMessage>>>(
    processing: F,
    work: &mut mpsc::UnboundedReceiver<Envelope>,
    events: &mpsc::UnboundedSender<InstanceEvent>,
    liveness: &Liveness,
    backlog: &mut VecDeque<Envelope>,
) -> Option<Result<InboundMessage>> {
    tokio::pin!(processing);
    let mut open = true;
    loop {
        tokio::select! {
            result = &mut processing => return Some(result),
            next = work.recv(), if open => match next {
                Some(Envelope::Probe) => {
                    if liveness.is_responsive() && events.send(InstanceEvent::Alive).is_err() {
                        return None;
                    }
                }
                Some(other) => backlog.push_back(other),
                None => open = false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Running,
    Recycling,
    Dead,
}

/// Production [`WorkerProxy`]: a queue in front of a swappable backend task.
pub struct ChannelWorker {
    role: Role,
    factory: Arc<dyn BackendFactory>,
    queue: VecDeque<OutboundMessage>,
    in_flight: Option<OutboundMessage>,
    pending: VecDeque<ProxyEvent>,
    instance: Option<Instance>,
    state: ProxyState,
    turn_count: u32,
    last_seen: DateTime<Utc>,
    probe_pending: bool,
}

impl ChannelWorker {
    /// Spawn the first instance. Must be called inside a tokio runtime.
    pub fn new(role: Role, factory: Arc<dyn BackendFactory>) -> Self {
        let backend = factory.spawn(role, SpawnContext::Fresh);
        Self {
            role,
            factory,
            queue: VecDeque::new(),
            in_flight: None,
            pending: VecDeque::new(),
            instance: Some(Instance::spawn(backend)),
            state: ProxyState::Running,
            turn_count: 0,
            last_seen: Utc::now(),
            probe_pending: false,
        }
    }

    /// Send the queue head to the instance if it is free.
    fn pump(&mut self) {
        if self.in_flight.is_some() || self.state != ProxyState::Running {
            return;
        }
        let Some(instance) = &self.instance else {
            return;
        };
        let Some(next) = self.queue.pop_front() else {
            return;
        };
        if let Err(mpsc::error::SendError(Envelope::Work(item))) =
            instance.work.send(Envelope::Work(next.clone()))
        {
            // instance is gone; keep the item for recovery
            self.queue.push_front(item);
            return;
        }
        self.pending
            .push_back(ProxyEvent::Dequeued(next.component_id.clone()));
        self.in_flight = Some(next);
    }

    fn replace_instance(&mut self, context: SpawnContext) {
        tracing::info!(role = %self.role, context = context.name(), "Spawning worker instance");
        // dropping the old instance aborts its task
        self.instance = None;
        let backend = self.factory.spawn(self.role, context);
        self.instance = Some(Instance::spawn(backend));
        self.turn_count = 0;
        self.probe_pending = false;
        self.state = ProxyState::Running;
    }

    fn finish_recycle(&mut self, summary: HandoffSummary) -> ProxyEvent {
        self.replace_instance(SpawnContext::Recycled {
            summary: summary.clone(),
        });
        self.pump();
        ProxyEvent::Recycled(summary)
    }

    fn status(&self) -> WorkerStatus {
        match self.state {
            ProxyState::Dead => WorkerStatus::Dead,
            ProxyState::Recycling => WorkerStatus::Recycling,
            ProxyState::Running if self.in_flight.is_some() => WorkerStatus::Active,
            ProxyState::Running => WorkerStatus::Idle,
        }
    }
}

impl WorkerProxy for ChannelWorker {
    fn role(&self) -> Role {
        self.role
    }

    fn assign(&mut self, message: OutboundMessage) {
        tracing::debug!(
            role = %self.role,
            component = %message.component_id,
            kind = ?message.kind,
            "Work item queued"
        );
        self.queue.push_back(message);
        self.pump();
    }

    fn poll(&mut self) -> Option<ProxyEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let event = self.instance.as_mut()?.events.try_recv().ok()?;
        self.last_seen = Utc::now();

        match event {
            InstanceEvent::Completed(message) => {
                if self
                    .in_flight
                    .as_ref()
                    .is_some_and(|m| m.component_id == message.component_id)
                {
                    self.in_flight = None;
                }
                self.turn_count = message.turn_count;
                self.pump();
                Some(ProxyEvent::Message(message))
            }
            InstanceEvent::Failed {
                component_id,
                error,
            } => {
                // in-flight item stays put until the instance is recovered
                Some(ProxyEvent::Message(InboundMessage::failure(
                    &component_id,
                    error,
                    self.turn_count,
                )))
            }
            InstanceEvent::Summary(summary) => Some(self.finish_recycle(summary)),
            InstanceEvent::SummaryFailed(error) => {
                tracing::warn!(role = %self.role, error = %error, "Handoff summary failed, recycling without it");
                Some(self.finish_recycle(HandoffSummary {
                    reason: format!("summary unavailable: {}", error),
                    ..Default::default()
                }))
            }
            InstanceEvent::Alive => {
                self.probe_pending = false;
                Some(ProxyEvent::ProbeAnswered)
            }
        }
    }

    fn health(&self) -> HealthReport {
        HealthReport {
            role: self.role,
            status: self.status(),
            turn_count: self.turn_count,
            queue_depth: self.queue.len(),
            in_flight: self.in_flight.as_ref().map(|m| m.component_id.clone()),
            last_seen: self.last_seen,
            probe_pending: self.probe_pending,
        }
    }

    fn probe(&mut self) -> ProbeOutcome {
        let Some(instance) = &self.instance else {
            return ProbeOutcome::Dead;
        };
        if instance.handle.is_finished() || instance.work.send(Envelope::Probe).is_err() {
            return ProbeOutcome::Dead;
        }
        self.probe_pending = true;
        ProbeOutcome::Sent
    }

    fn request_handoff(&mut self, request: HandoffRequest) -> bool {
        if self.state != ProxyState::Running || self.in_flight.is_some() {
            return false;
        }
        let Some(instance) = &self.instance else {
            return false;
        };
        if instance.work.send(Envelope::Handoff(request)).is_err() {
            return false;
        }
        self.state = ProxyState::Recycling;
        true
    }

    fn recover(&mut self, context: RecoveryContext) {
        if let Some(item) = self.in_flight.take() {
            self.queue.push_front(item);
        }
        self.replace_instance(SpawnContext::Recovery { context });
        self.pump();
    }

    fn halt(&mut self) {
        self.state = ProxyState::Dead;
        self.instance = None;
    }

    fn queued(&self) -> Vec<String> {
        self.in_flight
            .iter()
            .chain(self.queue.iter())
            .map(|m| m.component_id.clone())
            .collect()
    }

    fn shutdown(&mut self) {
        self.halt();
    }
}
