use super::AuditRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

enum Sink {
    File {
        path: PathBuf,
        writer: BufWriter<File>,
    },
    Memory,
}

/// Append-only transition log for one run.
///
/// File-backed logs write one JSON record per line to
/// `<audit_dir>/runs/<timestamp>_<run8>.jsonl` and flush before returning, so
/// a record is on disk before the transition it describes takes effect.
pub struct AuditLog {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    sink: Sink,
    records: Vec<AuditRecord>,
}

impl AuditLog {
    pub fn create(audit_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let runs_dir = audit_dir.join("runs");
        fs::create_dir_all(&runs_dir)
            .with_context(|| format!("Failed to create {}", runs_dir.display()))?;

        let filename = format!(
            "{}_{}.jsonl",
            started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run_id.to_string()[..8]
        );
        let path = runs_dir.join(filename);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;

        Ok(Self {
            run_id,
            started_at,
            sink: Sink::File {
                path,
                writer: BufWriter::new(file),
            },
            records: Vec::new(),
        })
    }

    /// A log that only keeps records in memory.
    pub fn in_memory() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sink: Sink::Memory,
            records: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            Sink::Memory => None,
        }
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    /// Records for one component, oldest first.
    pub fn history(&self, component_id: &str) -> Vec<&AuditRecord> {
        self.records
            .iter()
            .filter(|r| r.component_id == component_id)
            .collect()
    }

    /// Persist a record. The record is kept in memory only once it is durable.
    pub fn append(&mut self, record: AuditRecord) -> Result<()> {
        if let Sink::File { writer, .. } = &mut self.sink {
            let line = serde_json::to_string(&record).context("Failed to serialize audit record")?;
            writeln!(writer, "{}", line).context("Failed to write audit record")?;
            writer.flush().context("Failed to flush audit log")?;
        }
        self.records.push(record);
        Ok(())
    }

    /// Write the run summary next to the record file.
    pub fn finish_run<T: Serialize>(&mut self, summary: &T) -> Result<Option<PathBuf>> {
        let Sink::File { path, writer } = &mut self.sink else {
            return Ok(None);
        };
        writer.flush().context("Failed to flush audit log")?;

        let summary_file = summary_path(path);
        let json =
            serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
        fs::write(&summary_file, json).context("Failed to write run summary")?;
        Ok(Some(summary_file))
    }
}

/// `<run>.jsonl` → `<run>.summary.json`
pub fn summary_path(run_file: &Path) -> PathBuf {
    run_file.with_extension("summary.json")
}

/// Record files in `<audit_dir>/runs`, most recent first.
pub fn list_runs(audit_dir: &Path) -> Result<Vec<PathBuf>> {
    let runs_dir = audit_dir.join("runs");
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
        .collect();

    runs.sort();
    runs.reverse();
    Ok(runs)
}

/// Find a run whose file name contains `needle` (a run id prefix or
/// timestamp). `latest` picks the most recent run.
pub fn find_run(audit_dir: &Path, needle: &str) -> Result<Option<PathBuf>> {
    let runs = list_runs(audit_dir)?;
    if needle == "latest" {
        return Ok(runs.into_iter().next());
    }
    Ok(runs.into_iter().find(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy().contains(needle))
            .unwrap_or(false)
    }))
}

pub fn load_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Malformed audit record at line {}", i + 1))
        })
        .collect()
}

/// Load the summary written by [`AuditLog::finish_run`], if the run finished.
pub fn load_summary<T: DeserializeOwned>(run_file: &Path) -> Result<Option<T>> {
    let path = summary_path(run_file);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).context("Failed to read run summary")?;
    let summary = serde_json::from_str(&content).context("Failed to parse run summary")?;
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Actor;
    use crate::component::Stage;
    use tempfile::TempDir;

    fn record(id: &str, from: Stage, to: Stage) -> AuditRecord {
        AuditRecord::new(id, from, to, Actor::Router)
    }

    #[test]
    fn test_append_is_durable_before_return() {
        let dir = TempDir::new().unwrap();
        let mut log = AuditLog::create(dir.path()).unwrap();
        log.append(record("a", Stage::Pending, Stage::Implementing))
            .unwrap();

        // read back without finishing or dropping the log
        let path = log.path().unwrap().to_path_buf();
        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_stage, Stage::Implementing);
    }

    #[test]
    fn test_records_are_appended_in_order() {
        let dir = TempDir::new().unwrap();
        let mut log = AuditLog::create(dir.path()).unwrap();
        log.append(record("a", Stage::Pending, Stage::Implementing))
            .unwrap();
        log.append(record("b", Stage::Pending, Stage::Implementing))
            .unwrap();
        log.append(record("a", Stage::Implementing, Stage::AwaitingReview))
            .unwrap();

        assert_eq!(log.history("a").len(), 2);
        let on_disk = load_records(log.path().unwrap()).unwrap();
        assert_eq!(on_disk, log.records());
    }

    #[test]
    fn test_finish_run_writes_summary() {
        let dir = TempDir::new().unwrap();
        let mut log = AuditLog::create(dir.path()).unwrap();
        let summary_file = log
            .finish_run(&serde_json::json!({"committed": ["a"]}))
            .unwrap()
            .unwrap();
        assert!(summary_file.to_string_lossy().ends_with(".summary.json"));

        let run_file = log.path().unwrap().to_path_buf();
        let summary: serde_json::Value = load_summary(&run_file).unwrap().unwrap();
        assert_eq!(summary["committed"][0], "a");
    }

    #[test]
    fn test_list_and_find_runs() {
        let dir = TempDir::new().unwrap();
        assert!(list_runs(dir.path()).unwrap().is_empty());

        let log = AuditLog::create(dir.path()).unwrap();
        let id8 = log.run_id().to_string()[..8].to_string();
        let runs = list_runs(dir.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(find_run(dir.path(), &id8).unwrap(), Some(runs[0].clone()));
        assert_eq!(find_run(dir.path(), "latest").unwrap(), Some(runs[0].clone()));
        assert!(find_run(dir.path(), "zzzzzzzz").unwrap().is_none());
    }

    #[test]
    fn test_in_memory_log() {
        let mut log = AuditLog::in_memory();
        log.append(record("a", Stage::Pending, Stage::Implementing))
            .unwrap();
        assert_eq!(log.records().len(), 1);
        assert!(log.path().is_none());
        assert!(log.finish_run(&()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{}\n").unwrap();
        let err = load_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
