//! Per-task retry state machine.
//!
//! ```text
//! ATTEMPTING -> (reject_both) -> RETRYING -> ATTEMPTING -> ... -> ESCALATING | ACCEPTING
//! ```
//!
//! The controller owns the task as the executors currently see it. Each
//! rejection folds the evaluator's feedback into a new copy of the task's
//! constraints, so later attempts carry every critique so far.

use tracing::{debug, info};

use crate::core::outcome::{EscalationReason, Slot, Verdict, VerdictKind};
use crate::core::task::Task;
use crate::orchestration::judge::{EvaluationError, EVALUATOR_UNAVAILABLE};

/// Where a task is in its attempt cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// Executors are producing candidates.
    Attempting,
    /// Rejected; the next attempt has not started yet.
    Retrying,
    /// Automated adjudication gave up; an external decision is needed.
    Escalating,
    /// A candidate was accepted.
    Accepting,
}

/// What the orchestrator should do after a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Close the task with the candidate in this slot.
    Accept(Slot),
    /// Run both strategies again with this feedback.
    Retry { feedback: Vec<String> },
    /// Hand the task to the escalation gate.
    Escalate(EscalationReason),
}

/// Drives one task through attempts, retries and the final decision.
///
/// # Example
///
/// ```
/// use duet::core::{Task, Verdict};
/// use duet::orchestration::{RetryController, RetryDecision};
///
/// let mut retry = RetryController::new(Task::new("T-001", "parse input"), 1);
/// retry.begin_attempt();
/// let decision = retry.on_verdict(Verdict::rejection("too slow", vec!["use a buffer".into()], 0.9));
/// assert!(matches!(decision, RetryDecision::Retry { .. }));
/// assert_eq!(retry.task().constraints, vec!["use a buffer".to_string()]);
/// ```
#[derive(Debug, Clone)]
pub struct RetryController {
    task: Task,
    max_retries: u32,
    retries: u32,
    attempts: u32,
    phase: RetryPhase,
    feedback: Vec<String>,
    verdicts: Vec<Verdict>,
}

impl RetryController {
    /// Create a controller for `task` allowing `max_retries` retries after
    /// the first attempt.
    pub fn new(task: Task, max_retries: u32) -> Self {
        Self {
            task,
            max_retries,
            retries: 0,
            attempts: 0,
            phase: RetryPhase::Attempting,
            feedback: Vec::new(),
            verdicts: Vec::new(),
        }
    }

    /// Start an executor round and return the task to attempt.
    pub fn begin_attempt(&mut self) -> &Task {
        self.attempts += 1;
        self.phase = RetryPhase::Attempting;
        debug!(task = %self.task.id, attempt = self.attempts, "attempt started");
        &self.task
    }

    /// Record a verdict and decide what happens next.
    pub fn on_verdict(&mut self, verdict: Verdict) -> RetryDecision {
        let kind = verdict.kind;
        let feedback = verdict.feedback.clone();
        self.verdicts.push(verdict);

        match kind {
            VerdictKind::AcceptFirst => {
                self.phase = RetryPhase::Accepting;
                RetryDecision::Accept(Slot::First)
            }
            VerdictKind::AcceptSecond => {
                self.phase = RetryPhase::Accepting;
                RetryDecision::Accept(Slot::Second)
            }
            VerdictKind::Merge => {
                self.phase = RetryPhase::Escalating;
                info!(task = %self.task.id, "merge requested, escalating");
                RetryDecision::Escalate(EscalationReason::MergeRequested)
            }
            VerdictKind::RejectBoth if self.retries < self.max_retries => {
                self.retries += 1;
                self.phase = RetryPhase::Retrying;
                self.task = self.task.with_constraints(feedback.iter().cloned());
                self.feedback = feedback.clone();
                info!(
                    task = %self.task.id,
                    retry = self.retries,
                    max_retries = self.max_retries,
                    "both candidates rejected, retrying"
                );
                RetryDecision::Retry { feedback }
            }
            VerdictKind::RejectBoth => {
                self.phase = RetryPhase::Escalating;
                info!(task = %self.task.id, attempts = self.attempts, "retries exhausted");
                RetryDecision::Escalate(EscalationReason::RetriesExhausted {
                    attempts: self.attempts,
                })
            }
        }
    }

    /// Treat a scoring failure as a rejection that consumes a retry.
    pub fn on_evaluation_error(&mut self, err: &EvaluationError) -> RetryDecision {
        let verdict = Verdict::rejection(
            format!("evaluation failed: {}", err),
            vec![EVALUATOR_UNAVAILABLE.to_string()],
            0.0,
        );
        self.on_verdict(verdict)
    }

    /// The task as the next attempt will see it.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Feedback from the latest rejection; empty before the first one.
    pub fn feedback(&self) -> &[String] {
        &self.feedback
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn into_verdicts(self) -> Vec<Verdict> {
        self.verdicts
    }
}
