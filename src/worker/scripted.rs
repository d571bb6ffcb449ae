//! Deterministic in-process workers.
//!
//! A [`Script`] decides how each role answers: approve everything by
//! default, or reject/fail a component a fixed number of times, hang or
//! crash a role's next N items. Used for `--dry-run` and the scenario tests.

use super::channel::{BackendFactory, Liveness, SpawnContext, WorkerBackend};
use super::message::{
    Handoff, HandoffRequest, HandoffSummary, InboundMessage, InboundPayload, OutboundMessage,
    OutboundPayload, TestHandoff, TestStatus, Verdict,
};
use super::Role;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_TURNS_PER_ITEM: u32 = 5;

#[derive(Debug)]
struct ScriptState {
    rejections: HashMap<String, u32>,
    test_failures: HashMap<String, u32>,
    hangs: HashMap<Role, u32>,
    crashes: HashMap<Role, u32>,
    turns_per_item: u32,
    delay: Duration,
    role_delays: HashMap<Role, Duration>,
    processed: Vec<(Role, String)>,
    spawns: Vec<(Role, &'static str)>,
}

/// Shared, cloneable description of how scripted workers behave.
#[derive(Debug, Clone)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl Script {
    /// Approve every review and pass every test run.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                rejections: HashMap::new(),
                test_failures: HashMap::new(),
                hangs: HashMap::new(),
                crashes: HashMap::new(),
                turns_per_item: DEFAULT_TURNS_PER_ITEM,
                delay: Duration::ZERO,
                role_delays: HashMap::new(),
                processed: Vec::new(),
                spawns: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject the next `times` reviews of `component`.
    pub fn reject(self, component: &str, times: u32) -> Self {
        self.lock().rejections.insert(component.to_string(), times);
        self
    }

    /// Fail the next `times` test runs of `component`.
    pub fn fail_tests(self, component: &str, times: u32) -> Self {
        self.lock().test_failures.insert(component.to_string(), times);
        self
    }

    /// The next `times` items sent to `role` never complete, and the
    /// instance stops answering probes.
    pub fn hang(self, role: Role, times: u32) -> Self {
        self.lock().hangs.insert(role, times);
        self
    }

    /// The next `times` items sent to `role` fail with an error.
    pub fn crash(self, role: Role, times: u32) -> Self {
        self.lock().crashes.insert(role, times);
        self
    }

    pub fn turns_per_item(self, turns: u32) -> Self {
        self.lock().turns_per_item = turns;
        self
    }

    /// Artificial processing time per item.
    pub fn delay(self, delay: Duration) -> Self {
        self.lock().delay = delay;
        self
    }

    /// Processing time per item for one role, overriding [`Script::delay`].
    pub fn slow(self, role: Role, delay: Duration) -> Self {
        self.lock().role_delays.insert(role, delay);
        self
    }

    /// Every item a backend started, in order.
    pub fn processed(&self) -> Vec<(Role, String)> {
        self.lock().processed.clone()
    }

    /// Every instance spawned, with how it was spawned.
    pub fn spawns(&self) -> Vec<(Role, &'static str)> {
        self.lock().spawns.clone()
    }

    /// Number of times `role` processed `component`.
    pub fn times_processed(&self, role: Role, component: &str) -> usize {
        self.lock()
            .processed
            .iter()
            .filter(|(r, c)| *r == role && c == component)
            .count()
    }
}

fn take_one<K: std::hash::Hash + Eq>(map: &mut HashMap<K, u32>, key: &K) -> bool {
    match map.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

enum Outcome {
    Answer,
    Hang,
    Crash,
}

/// Factory handing out [`ScriptedBackend`]s that share one [`Script`].
pub struct ScriptedFactory {
    script: Script,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self { script }
    }
}

impl BackendFactory for ScriptedFactory {
    fn spawn(&self, role: Role, context: SpawnContext) -> Box<dyn WorkerBackend> {
        self.script.lock().spawns.push((role, context.name()));
        Box::new(ScriptedBackend {
            role,
            script: self.script.clone(),
            turns: 0,
            completed: Vec::new(),
            liveness: Liveness::default(),
        })
    }
}

pub struct ScriptedBackend {
    role: Role,
    script: Script,
    turns: u32,
    completed: Vec<String>,
    liveness: Liveness,
}

impl ScriptedBackend {
    fn answer(&mut self, message: OutboundMessage) -> InboundPayload {
        let id = message.component_id.clone();
        match message.payload {
            OutboundPayload::Assignment(assignment) => {
                InboundPayload::Handoff(Handoff {
                    component_id: id.clone(),
                    files_created: assignment.files,
                    files_modified: Vec::new(),
                    summary: format!("implemented {} (attempt {})", id, assignment.attempt),
                })
            }
            OutboundPayload::ReviewRequest { .. } => {
                let reject = take_one(&mut self.script.lock().rejections, &id);
                if reject {
                    InboundPayload::ReviewResult {
                        component_id: id.clone(),
                        verdict: Verdict::Rejected,
                        issues: vec![format!("scripted rejection of {}", id)],
                    }
                } else {
                    InboundPayload::ReviewResult {
                        component_id: id,
                        verdict: Verdict::Approved,
                        issues: Vec::new(),
                    }
                }
            }
            OutboundPayload::TestRequest { .. } => InboundPayload::TestHandoff(TestHandoff {
                component_id: id.clone(),
                test_files: vec![PathBuf::from(format!("tests/{}_test.rs", id))],
                test_count: 1,
                run_command: format!("true {}", id),
            }),
            OutboundPayload::TestExecution { .. } => {
                let fail = take_one(&mut self.script.lock().test_failures, &id);
                InboundPayload::TestResult {
                    component_id: id.clone(),
                    status: if fail { TestStatus::Fail } else { TestStatus::Pass },
                    failures: if fail {
                        vec![format!("scripted failure of {}", id)]
                    } else {
                        Vec::new()
                    },
                }
            }
        }
    }
}

#[async_trait]
impl WorkerBackend for ScriptedBackend {
    async fn process(&mut self, message: OutboundMessage) -> Result<InboundMessage> {
        let (outcome, delay, turns) = {
            let mut state = self.script.lock();
            state
                .processed
                .push((self.role, message.component_id.clone()));
            let outcome = if take_one(&mut state.hangs, &self.role) {
                Outcome::Hang
            } else if take_one(&mut state.crashes, &self.role) {
                Outcome::Crash
            } else {
                Outcome::Answer
            };
            let delay = state
                .role_delays
                .get(&self.role)
                .copied()
                .unwrap_or(state.delay);
            (outcome, delay, state.turns_per_item)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            Outcome::Hang => {
                self.liveness.set_responsive(false);
                std::future::pending::<()>().await
            }
            Outcome::Crash => bail!("scripted crash in {}", self.role),
            Outcome::Answer => {}
        }

        self.turns += turns;
        let component_id = message.component_id.clone();
        let payload = self.answer(message);
        self.completed.push(component_id.clone());
        Ok(InboundMessage {
            component_id,
            payload,
            turn_count: self.turns,
        })
    }

    async fn summarize(&mut self, request: HandoffRequest) -> Result<HandoffSummary> {
        Ok(HandoffSummary {
            reason: request.reason,
            completed_work: self.completed.clone(),
            in_progress: Vec::new(),
            context_notes: format!("{} turns used", self.turns),
        })
    }

    fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }
}
