//! Core domain models for duet orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, the execution DAG, and the value records
//! (candidates, verdicts, results) produced while running it.

pub mod dag;
pub mod outcome;
pub mod stats;
pub mod task;

pub use dag::{GraphError, Schedule, TaskGraph};
pub use outcome::{
    Candidate, CriterionScore, EscalationReason, EscalationRecord, ExecutionResult,
    ExecutionStatus, PendingEscalation, RunId, RunSummary, Slot, Strategy, VerdictKind,
    Verdict, VerificationReport,
};
pub use stats::{EvaluatorStats, RunStats, StrategyStats, Timing};
pub use task::{Criticality, Task, TaskId};
