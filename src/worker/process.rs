//! Workers backed by an external command.
//!
//! Each work item runs the configured command once. The request is written to
//! stdin as a single JSON object and the command must print one
//! [`InboundMessage`] as JSON on stdout (the last line that parses wins, so
//! free-form logging before it is fine). The reported `turn_count` is the
//! turns spent on that item; the backend accumulates it per instance.
//! While the child is running the instance answers status probes, so a long
//! item is never mistaken for a silent worker. A child that dies surfaces as
//! a failure instead.

use super::channel::{BackendFactory, SpawnContext, WorkerBackend};
use super::message::{HandoffRequest, HandoffSummary, InboundMessage, OutboundMessage};
use super::Role;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// How to launch one role's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// JSON document sent to the worker on stdin.
#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    role: Role,
    context: &'a SpawnContext,
    message: &'a OutboundMessage,
}

pub struct ProcessBackend {
    role: Role,
    command: WorkerCommand,
    working_dir: PathBuf,
    context: SpawnContext,
    turns: u32,
    completed: Vec<String>,
}

impl ProcessBackend {
    pub fn new(role: Role, command: WorkerCommand, working_dir: PathBuf, context: SpawnContext) -> Self {
        Self {
            role,
            command,
            working_dir,
            context,
            turns: 0,
            completed: Vec::new(),
        }
    }
}

/// Parse the last stdout line that is a valid inbound message.
fn parse_output(stdout: &str) -> Option<InboundMessage> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str(line).ok())
        .or_else(|| serde_json::from_str(stdout.trim()).ok())
}

#[async_trait]
impl WorkerBackend for ProcessBackend {
    async fn process(&mut self, message: OutboundMessage) -> Result<InboundMessage> {
        let request = serde_json::to_vec(&WorkerRequest {
            role: self.role,
            context: &self.context,
            message: &message,
        })
        .context("Failed to serialize worker request")?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn {} worker: {}",
                    self.role, self.command.program
                )
            })?;

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(&request).await
        {
            // the exit status below says what went wrong
            tracing::debug!(role = %self.role, error = %e, "Worker closed stdin early");
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {} worker", self.role))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} worker exited with {}: {}",
                self.role,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(mut inbound) = parse_output(&stdout) else {
            bail!("{} worker printed no valid result", self.role);
        };
        if inbound.component_id != message.component_id {
            bail!(
                "{} worker answered for {} while working on {}",
                self.role,
                inbound.component_id,
                message.component_id
            );
        }

        self.turns += inbound.turn_count.max(1);
        inbound.turn_count = self.turns;
        self.completed.push(message.component_id);
        Ok(inbound)
    }

    async fn summarize(&mut self, request: HandoffRequest) -> Result<HandoffSummary> {
        // each item is a fresh process, so the summary is what we tracked here
        Ok(HandoffSummary {
            reason: request.reason,
            completed_work: self.completed.clone(),
            in_progress: Vec::new(),
            context_notes: format!("{} turns across {} items", self.turns, self.completed.len()),
        })
    }
}

/// Spawns [`ProcessBackend`]s from a per-role command table.
pub struct ProcessFactory {
    commands: BTreeMap<Role, WorkerCommand>,
    working_dir: PathBuf,
}

impl ProcessFactory {
    pub fn new(commands: BTreeMap<Role, WorkerCommand>, working_dir: PathBuf) -> Self {
        Self {
            commands,
            working_dir,
        }
    }

    /// Roles with no command configured.
    pub fn missing_roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|r| !self.commands.contains_key(r))
            .collect()
    }
}

impl BackendFactory for ProcessFactory {
    fn spawn(&self, role: Role, context: SpawnContext) -> Box<dyn WorkerBackend> {
        let command = self.commands.get(&role).cloned().unwrap_or(WorkerCommand {
            program: String::from("false"),
            args: Vec::new(),
        });
        Box::new(ProcessBackend::new(
            role,
            command,
            self.working_dir.clone(),
            context,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::message::{InboundPayload, OutboundKind, OutboundPayload};
    use tempfile::tempdir;

    fn execution(id: &str) -> OutboundMessage {
        OutboundMessage {
            component_id: id.into(),
            kind: OutboundKind::Assignment,
            attempt: 1,
            payload: OutboundPayload::TestExecution {
                component_id: id.into(),
                test_files: vec![],
                run_command: "true".into(),
            },
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[test]
    fn test_parse_output_takes_last_json_line() {
        let stdout = "starting\n{\"component_id\":\"a\",\"turn_count\":2,\"payload\":{\"type\":\"failure\",\"reason\":\"x\"}}\n";
        let msg = parse_output(stdout).unwrap();
        assert_eq!(msg.component_id, "a");
        assert!(parse_output("no json here").is_none());
    }

    #[tokio::test]
    async fn test_process_backend_round_trip() {
        let dir = tempdir().unwrap();
        let command = sh(
            r#"cat > request.json; echo '{"component_id":"a","turn_count":3,"payload":{"type":"test_result","component_id":"a","status":"pass"}}'"#,
        );
        let mut backend = ProcessBackend::new(
            Role::TestRunner,
            command,
            dir.path().to_path_buf(),
            SpawnContext::Fresh,
        );

        let first = backend.process(execution("a")).await.unwrap();
        assert!(matches!(first.payload, InboundPayload::TestResult { .. }));
        assert_eq!(first.turn_count, 3);
        let second = backend.process(execution("a")).await.unwrap();
        assert_eq!(second.turn_count, 6);

        let request = std::fs::read_to_string(dir.path().join("request.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&request).unwrap();
        assert_eq!(value["role"], "test-runner");
        assert_eq!(value["context"]["type"], "fresh");
        assert_eq!(value["message"]["payload"]["type"], "test_execution");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempdir().unwrap();
        let mut backend = ProcessBackend::new(
            Role::Reviewer,
            sh("echo boom >&2; exit 3"),
            dir.path().to_path_buf(),
            SpawnContext::Fresh,
        );
        let err = backend.process(execution("a")).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_mismatched_component_is_error() {
        let dir = tempdir().unwrap();
        let mut backend = ProcessBackend::new(
            Role::TestRunner,
            sh(r#"cat >/dev/null; echo '{"component_id":"other","turn_count":1,"payload":{"type":"failure","reason":"x"}}'"#),
            dir.path().to_path_buf(),
            SpawnContext::Fresh,
        );
        assert!(backend.process(execution("a")).await.is_err());
    }

    #[test]
    fn test_missing_roles() {
        let mut commands = BTreeMap::new();
        commands.insert(Role::Implementer, sh("true"));
        let factory = ProcessFactory::new(commands, PathBuf::from("."));
        assert_eq!(
            factory.missing_roles(),
            vec![Role::Reviewer, Role::TestWriter, Role::TestRunner]
        );
    }
}
