//! Worker proxies: the only way the orchestrator talks to pipeline roles.
//!
//! A [`WorkerProxy`] accepts typed work items without blocking, hands back
//! results through [`WorkerProxy::poll`], and exposes a health report. The
//! router never depends on anything role-specific beyond this trait.

pub mod channel;
pub mod message;
pub mod process;
pub mod scripted;

pub use channel::{BackendFactory, ChannelWorker, Liveness, SpawnContext, WorkerBackend};
pub use message::{HandoffRequest, HandoffSummary, InboundMessage, OutboundMessage};
pub use process::{ProcessBackend, ProcessFactory, WorkerCommand};
pub use scripted::{Script, ScriptedFactory};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four fixed pipeline roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Implementer,
    Reviewer,
    TestWriter,
    TestRunner,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Implementer,
        Role::Reviewer,
        Role::TestWriter,
        Role::TestRunner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::TestWriter => "test-writer",
            Role::TestRunner => "test-runner",
        }
    }

    /// Environment variable that overrides this role's worker command.
    pub fn env_var(self) -> String {
        format!(
            "STAGEHAND_{}_CMD",
            self.as_str().replace('-', "_").to_uppercase()
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s || r.as_str().replace('-', "_") == s)
            .ok_or_else(|| format!("unknown role '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Active,
    Recycling,
    Dead,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Active => "active",
            WorkerStatus::Recycling => "recycling",
            WorkerStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Point-in-time health of one proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub role: Role,
    pub status: WorkerStatus,
    /// Last self-reported turn count of the live instance
    pub turn_count: u32,
    /// Items waiting behind the in-flight one
    pub queue_depth: usize,
    pub in_flight: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// A status probe was sent and not yet answered
    pub probe_pending: bool,
}

impl HealthReport {
    /// Work is outstanding on the live instance.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.status == WorkerStatus::Recycling
    }
}

/// Something a proxy observed since the last poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// An item left the proxy queue and reached the worker instance.
    Dequeued(String),
    Message(InboundMessage),
    /// The instance was swapped for a fresh one seeded with this summary.
    Recycled(HandoffSummary),
    ProbeAnswered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe queued on the live instance; an answer arrives via `poll`.
    Sent,
    /// The instance is already gone.
    Dead,
}

/// Externally observable state of a worker at the moment it was declared
/// silent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub in_flight: Option<String>,
    pub queued: Vec<String>,
    pub turn_count: u32,
    pub last_seen: DateTime<Utc>,
}

/// Context handed to a replacement instance after a silent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub role: Role,
    pub reason: String,
    /// 1-based count of silent failures for this role in the run
    pub failure_number: u32,
    pub snapshot: WorkerSnapshot,
    /// Uncommitted changes of the in-flight component, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// The non-blocking interface every pipeline role is addressed through.
pub trait WorkerProxy: Send {
    fn role(&self) -> Role;

    /// Enqueue a work item. Never blocks.
    fn assign(&mut self, message: OutboundMessage);

    /// Next observed event, if any. Never blocks.
    fn poll(&mut self) -> Option<ProxyEvent>;

    fn health(&self) -> HealthReport;

    fn probe(&mut self) -> ProbeOutcome;

    /// Ask the live instance to summarise itself ahead of a recycle.
    /// Returns false if the proxy is busy and the request was not sent.
    fn request_handoff(&mut self, request: HandoffRequest) -> bool;

    /// Replace the live instance after a silent failure. The in-flight item
    /// is requeued at the front.
    fn recover(&mut self, context: RecoveryContext);

    /// Stop processing. Queued work stays put and is reported.
    fn halt(&mut self);

    /// Component ids in flight or queued, in processing order.
    fn queued(&self) -> Vec<String>;

    fn shutdown(&mut self);

    /// Externally observable state, for recovery records.
    fn snapshot(&self) -> WorkerSnapshot {
        let health = self.health();
        let queued = self
            .queued()
            .into_iter()
            .skip(usize::from(health.in_flight.is_some()))
            .collect();
        WorkerSnapshot {
            in_flight: health.in_flight,
            queued,
            turn_count: health.turn_count,
            last_seen: health.last_seen,
        }
    }
}
