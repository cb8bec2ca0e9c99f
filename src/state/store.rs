//! Persistence of execution records.
//!
//! Records are append-only. A task's result is written once when it reaches
//! a terminal status; resolving a pending escalation later appends a
//! superseding record, and readers keep the last record per task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::outcome::{ExecutionResult, RunId, RunSummary, Strategy, VerdictKind};
use crate::core::stats::RunStats;
use crate::core::task::TaskId;
use crate::{Error, Result};

const RESULTS_FILE: &str = "results.jsonl";
const TRACES_FILE: &str = "traces.jsonl";
const SUMMARY_FILE: &str = "summary.json";

/// Timing and usage telemetry for one external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceKind,
}

impl TraceEvent {
    pub fn new(run_id: RunId, task_id: TaskId, kind: TraceKind) -> Self {
        Self {
            run_id,
            task_id,
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TraceKind {
    ExecutorCall {
        strategy: Strategy,
        attempt: u32,
        elapsed_ms: u64,
        tokens_used: Option<u64>,
        passed: bool,
        error: Option<String>,
    },
    EvaluatorCall {
        profile: String,
        attempt: u32,
        elapsed_ms: u64,
        verdict: Option<VerdictKind>,
        error: Option<String>,
    },
    Escalation {
        reason: String,
        outcome: String,
    },
}

/// Fold recorded traces into per-strategy and evaluator statistics.
pub fn aggregate(traces: &[TraceEvent]) -> RunStats {
    let mut stats = RunStats::default();
    for event in traces {
        match &event.kind {
            TraceKind::ExecutorCall {
                strategy,
                elapsed_ms,
                tokens_used,
                passed,
                error,
                ..
            } => stats.record_executor_call(*strategy, *elapsed_ms, *tokens_used, *passed, error.is_some()),
            TraceKind::EvaluatorCall {
                elapsed_ms, error, ..
            } => stats.record_evaluator_call(*elapsed_ms, error.is_some()),
            TraceKind::Escalation { .. } => stats.record_escalation(),
        }
    }
    stats
}

/// Storage for run records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Append a terminal result for a task.
    async fn append_result(&self, run_id: &RunId, result: &ExecutionResult) -> Result<()>;

    /// Results of a run, one per task (the last record written wins), in
    /// the order tasks were first recorded.
    async fn load_run(&self, run_id: &RunId) -> Result<Vec<ExecutionResult>>;

    /// Append a telemetry event.
    async fn append_trace(&self, event: &TraceEvent) -> Result<()>;

    /// Telemetry recorded for a run, oldest first.
    async fn load_traces(&self, run_id: &RunId) -> Result<Vec<TraceEvent>>;

    async fn save_summary(&self, summary: &RunSummary) -> Result<()>;

    async fn load_summary(&self, run_id: &RunId) -> Result<Option<RunSummary>>;
}

/// Keep the last record per task, ordered by first appearance.
fn latest_per_task(records: Vec<ExecutionResult>) -> Vec<ExecutionResult> {
    let mut order: Vec<TaskId> = Vec::new();
    let mut latest: HashMap<TaskId, ExecutionResult> = HashMap::new();
    for record in records {
        if !latest.contains_key(&record.task_id) {
            order.push(record.task_id.clone());
        }
        latest.insert(record.task_id.clone(), record);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

/// File-backed store: one directory per run holding JSON-lines results
/// and traces plus a JSON summary.
///
/// ```text
/// <root>/<run_id>/results.jsonl
/// <root>/<run_id>/traces.jsonl
/// <root>/<run_id>/summary.json
/// ```
#[derive(Debug)]
pub struct JsonStateStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "JsonStateStore opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Runs with a directory under the root, most recently modified first.
    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(run_id) = entry.file_name().to_string_lossy().parse::<RunId>() else {
                continue;
            };
            let modified = entry.metadata().await?.modified()?;
            runs.push((modified, run_id));
        }
        runs.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(runs.into_iter().map(|(_, id)| id).collect())
    }

    async fn append_line(&self, run_id: &RunId, file: &str, line: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).await?;
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))
            .await?;
        handle.write_all(format!("{}\n", line).as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn append_result(&self, run_id: &RunId, result: &ExecutionResult) -> Result<()> {
        if !result.status.is_persisted() {
            return Err(Error::Store(format!(
                "refusing to persist {} result for {}",
                result.status, result.task_id
            )));
        }
        self.append_line(run_id, RESULTS_FILE, serde_json::to_string(result)?)
            .await?;
        debug!(run = %run_id.short(), task = %result.task_id, status = %result.status, "result appended");
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Vec<ExecutionResult>> {
        let path = self.run_dir(run_id).join(RESULTS_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionResult>(line) {
                Ok(record) => records.push(record),
                // A torn final line after a crash; earlier records stay valid.
                Err(err) => warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %err,
                    "skipping unreadable result record"
                ),
            }
        }
        Ok(latest_per_task(records))
    }

    async fn append_trace(&self, event: &TraceEvent) -> Result<()> {
        self.append_line(&event.run_id, TRACES_FILE, serde_json::to_string(event)?)
            .await
    }

    async fn load_traces(&self, run_id: &RunId) -> Result<Vec<TraceEvent>> {
        let path = self.run_dir(run_id).join(TRACES_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).await?;
        let traces = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable trace");
                    None
                }
            })
            .collect();
        Ok(traces)
    }

    async fn save_summary(&self, summary: &RunSummary) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.run_dir(&summary.run_id);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.tmp", SUMMARY_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(summary)?).await?;
        fs::rename(&tmp, dir.join(SUMMARY_FILE)).await?;
        Ok(())
    }

    async fn load_summary(&self, run_id: &RunId) -> Result<Option<RunSummary>> {
        let path = self.run_dir(run_id).join(SUMMARY_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// In-memory store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    results: Mutex<HashMap<RunId, Vec<ExecutionResult>>>,
    traces: Mutex<Vec<TraceEvent>>,
    summaries: Mutex<HashMap<RunId, RunSummary>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record appended for a run, superseded ones included.
    pub async fn raw_results(&self, run_id: &RunId) -> Vec<ExecutionResult> {
        self.results
            .lock()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn traces(&self) -> Vec<TraceEvent> {
        self.traces.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn append_result(&self, run_id: &RunId, result: &ExecutionResult) -> Result<()> {
        if !result.status.is_persisted() {
            return Err(Error::Store(format!(
                "refusing to persist {} result for {}",
                result.status, result.task_id
            )));
        }
        self.results
            .lock()
            .await
            .entry(*run_id)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Vec<ExecutionResult>> {
        Ok(latest_per_task(self.raw_results(run_id).await))
    }

    async fn append_trace(&self, event: &TraceEvent) -> Result<()> {
        self.traces.lock().await.push(event.clone());
        Ok(())
    }

    async fn load_traces(&self, run_id: &RunId) -> Result<Vec<TraceEvent>> {
        Ok(self
            .traces
            .lock()
            .await
            .iter()
            .filter(|event| &event.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn save_summary(&self, summary: &RunSummary) -> Result<()> {
        self.summaries
            .lock()
            .await
            .insert(summary.run_id, summary.clone());
        Ok(())
    }

    async fn load_summary(&self, run_id: &RunId) -> Result<Option<RunSummary>> {
        Ok(self.summaries.lock().await.get(run_id).cloned())
    }
}
