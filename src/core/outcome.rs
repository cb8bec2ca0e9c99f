//! Value records produced while executing tasks.
//!
//! Candidates and verdicts are immutable values created per attempt. An
//! `ExecutionResult` is the durable outcome of a task and is written to the
//! state store exactly once.

use crate::core::stats::RunStats;
use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Executor strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fast, clean, idiomatic output.
    Pragmatic,
    /// Security and edge cases first.
    SecurityFirst,
    /// Optimisation focused.
    PerformanceFirst,
    /// Deep reasoning, all considerations.
    Comprehensive,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Pragmatic => write!(f, "pragmatic"),
            Strategy::SecurityFirst => write!(f, "security_first"),
            Strategy::PerformanceFirst => write!(f, "performance_first"),
            Strategy::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

/// Which of the two candidates of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    First,
    Second,
}

/// Outcome of verifying a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl VerificationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostics: vec![diagnostic.into()],
        }
    }

    /// Combine two reports; the result passes only if both pass.
    pub fn merge(mut self, other: VerificationReport) -> Self {
        self.passed = self.passed && other.passed;
        self.diagnostics.extend(other.diagnostics);
        self
    }
}

/// One executor strategy's attempt at a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub strategy: Strategy,
    /// Produced artifact; empty when the executor failed.
    pub artifact: String,
    pub verification: VerificationReport,
    /// Wall-clock duration of the executor call.
    pub elapsed_ms: u64,
    pub tokens_used: Option<u64>,
    /// Executor error or timeout text.
    pub error: Option<String>,
}

impl Candidate {
    /// A candidate standing in for an executor call that produced nothing.
    pub fn failed(strategy: Strategy, error: impl Into<String>, elapsed_ms: u64) -> Self {
        let error = error.into();
        Self {
            strategy,
            artifact: String::new(),
            verification: VerificationReport::fail(error.clone()),
            elapsed_ms,
            tokens_used: None,
            error: Some(error),
        }
    }

    pub fn passed(&self) -> bool {
        self.verification.passed
    }
}

/// Evaluator decision over a pair of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    AcceptFirst,
    AcceptSecond,
    Merge,
    RejectBoth,
}

impl VerdictKind {
    /// The accepted slot for accept verdicts.
    pub fn accepted(&self) -> Option<Slot> {
        match self {
            VerdictKind::AcceptFirst => Some(Slot::First),
            VerdictKind::AcceptSecond => Some(Slot::Second),
            VerdictKind::Merge | VerdictKind::RejectBoth => None,
        }
    }
}

impl std::fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictKind::AcceptFirst => write!(f, "ACCEPT_FIRST"),
            VerdictKind::AcceptSecond => write!(f, "ACCEPT_SECOND"),
            VerdictKind::Merge => write!(f, "MERGE"),
            VerdictKind::RejectBoth => write!(f, "REJECT_BOTH"),
        }
    }
}

/// Score of both candidates on one weighted criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub name: String,
    pub weight: f64,
    pub first: f64,
    pub second: f64,
}

/// The evaluator's structured judgment over two candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    /// Confidence in the decision, in `[0, 1]`.
    pub confidence: f64,
    /// Weighted total of the first candidate (0-100).
    pub first_score: f64,
    /// Weighted total of the second candidate (0-100).
    pub second_score: f64,
    #[serde(default)]
    pub breakdown: Vec<CriterionScore>,
    pub reasoning: String,
    /// Actionable feedback for the next attempt; non-empty on `RejectBoth`.
    #[serde(default)]
    pub feedback: Vec<String>,
    /// Evaluator profile that scored the pair; empty when scoring was skipped.
    #[serde(default)]
    pub evaluator: String,
}

impl Verdict {
    /// A rejection that never reached the scoring backend.
    pub fn rejection(reasoning: impl Into<String>, feedback: Vec<String>, confidence: f64) -> Self {
        Self {
            kind: VerdictKind::RejectBoth,
            confidence,
            first_score: 0.0,
            second_score: 0.0,
            breakdown: Vec::new(),
            reasoning: reasoning.into(),
            feedback,
            evaluator: String::new(),
        }
    }

    /// Weighted score of the given slot.
    pub fn score(&self, slot: Slot) -> f64 {
        match slot {
            Slot::First => self.first_score,
            Slot::Second => self.second_score,
        }
    }
}

/// Opaque handle for an escalation awaiting an external decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingEscalation(pub String);

impl std::fmt::Display for PendingEscalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why automated adjudication deferred to an external decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationReason {
    /// Every attempt was rejected and the retry budget is spent.
    RetriesExhausted { attempts: u32 },
    /// The evaluator found both candidates comparable; no automatic merge.
    MergeRequested,
    /// An accept verdict was not confident enough to close the task.
    LowConfidence { confidence: f64, threshold: f64 },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationReason::RetriesExhausted { attempts } => {
                write!(f, "rejected on all {} attempts", attempts)
            }
            EscalationReason::MergeRequested => {
                write!(f, "evaluator recommends merging both candidates")
            }
            EscalationReason::LowConfidence {
                confidence,
                threshold,
            } => write!(
                f,
                "evaluator confidence {:.2} below threshold {:.2}",
                confidence, threshold
            ),
        }
    }
}

/// Escalation details carried by an execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub reason: EscalationReason,
    /// Token to poll while the decision is outstanding.
    pub pending: Option<PendingEscalation>,
    /// Description of how the escalation was resolved, if it was.
    pub resolution: Option<String>,
}

/// Task outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    /// Waiting on, or abandoned by, an external decision.
    Escalated,
    /// An external decision-maker rejected both candidates.
    Rejected,
    /// Never started in this run. Not persisted.
    Skipped,
}

impl ExecutionStatus {
    /// Whether results with this status are written to the state store.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, ExecutionStatus::Skipped)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Escalated => write!(f, "escalated"),
            ExecutionStatus::Rejected => write!(f, "rejected"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// The durable outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    /// Final artifact; present iff the task completed.
    pub artifact: Option<String>,
    /// Number of executor rounds.
    pub attempts: u32,
    #[serde(default)]
    pub verdicts: Vec<Verdict>,
    pub escalation: Option<EscalationRecord>,
    /// Failure or skip detail.
    pub detail: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    fn base(task_id: TaskId, status: ExecutionStatus, attempts: u32) -> Self {
        Self {
            task_id,
            status,
            artifact: None,
            attempts,
            verdicts: Vec::new(),
            escalation: None,
            detail: None,
            finished_at: Utc::now(),
        }
    }

    pub fn completed(task_id: TaskId, artifact: String, attempts: u32, verdicts: Vec<Verdict>) -> Self {
        Self {
            artifact: Some(artifact),
            verdicts,
            ..Self::base(task_id, ExecutionStatus::Completed, attempts)
        }
    }

    pub fn failed(task_id: TaskId, detail: impl Into<String>, attempts: u32, verdicts: Vec<Verdict>) -> Self {
        Self {
            detail: Some(detail.into()),
            verdicts,
            ..Self::base(task_id, ExecutionStatus::Failed, attempts)
        }
    }

    pub fn escalated(
        task_id: TaskId,
        reason: EscalationReason,
        pending: Option<PendingEscalation>,
        detail: Option<String>,
        attempts: u32,
        verdicts: Vec<Verdict>,
    ) -> Self {
        Self {
            escalation: Some(EscalationRecord {
                reason,
                pending,
                resolution: None,
            }),
            detail,
            verdicts,
            ..Self::base(task_id, ExecutionStatus::Escalated, attempts)
        }
    }

    pub fn skipped(task_id: TaskId, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::base(task_id, ExecutionStatus::Skipped, 0)
        }
    }

    /// Superseding record for a resolved escalation.
    ///
    /// `resolution` describes the decision; `artifact` is `Some` when the
    /// decision-maker supplied or chose an artifact and `None` on rejection.
    pub fn resolve(&self, artifact: Option<String>, resolution: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.escalation = self.escalation.clone().map(|record| EscalationRecord {
            pending: None,
            resolution: Some(resolution.into()),
            ..record
        });
        next.status = if artifact.is_some() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Rejected
        };
        next.artifact = artifact;
        next.finished_at = Utc::now();
        next
    }

    /// Token of an outstanding escalation, if any.
    pub fn pending_escalation(&self) -> Option<&PendingEscalation> {
        if self.status != ExecutionStatus::Escalated {
            return None;
        }
        self.escalation.as_ref().and_then(|e| e.pending.as_ref())
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Whole-run summary: one result per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub results: Vec<ExecutionResult>,
    pub cancelled: bool,
    pub deadline_elapsed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Call statistics aggregated from the run's traces.
    #[serde(default)]
    pub stats: RunStats,
}

impl RunSummary {
    pub fn get(&self, task_id: &TaskId) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| &r.task_id == task_id)
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Whether every task completed.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(ExecutionResult::is_completed)
    }
}
