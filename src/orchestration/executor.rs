//! Executor and verifier capabilities.
//!
//! An `Executor` turns a task plus a strategy into a draft artifact; a
//! `Verifier` checks a candidate against the task. The core never trusts
//! either to behave: the executor call and the verification of its draft
//! share one deadline, and any error, timeout or empty artifact is folded
//! into a failed [`Candidate`] that flows into normal adjudication.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::core::outcome::{Candidate, Strategy, VerificationReport};
use crate::core::task::Task;
use crate::util::{millis, timed};

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("executor failed: {0}")]
    Failed(String),

    #[error("executor returned an empty artifact")]
    EmptyArtifact,

    #[error("executor timed out after {0:?}")]
    Timeout(Duration),
}

/// What an executor hands back for one attempt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Draft {
    pub artifact: String,
    /// The executor's own verification of the artifact, if it ran one.
    pub self_check: Option<VerificationReport>,
    pub tokens_used: Option<u64>,
}

impl Draft {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            self_check: None,
            tokens_used: None,
        }
    }

    pub fn with_self_check(mut self, report: VerificationReport) -> Self {
        self.self_check = Some(report);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// The text-generation capability.
///
/// Implementations must be safe to call again for the same task (retries
/// re-invoke them) and must report inability to produce an artifact as an
/// error rather than an empty draft.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Produce a draft for `task` using `strategy`.
    ///
    /// `feedback` holds the evaluator's critique of the previous attempt and
    /// is empty on the first attempt.
    async fn attempt(
        &self,
        task: &Task,
        strategy: Strategy,
        feedback: &[String],
    ) -> Result<Draft, ExecutorError>;
}

/// Domain verification of a candidate (syntax checks, test runs, ...).
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, candidate: &Candidate, task: &Task) -> VerificationReport;
}

/// Verifier that passes every candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Verifier for AcceptAll {
    async fn verify(&self, _candidate: &Candidate, _task: &Task) -> VerificationReport {
        VerificationReport::pass()
    }
}

/// Run one executor call and verify the result, both within `limit`.
///
/// Never fails: executor errors, timeouts and empty artifacts come back as
/// a candidate whose verification did not pass. A verifier that runs past
/// the deadline fails the candidate's verification.
pub async fn produce_candidate(
    executor: &dyn Executor,
    verifier: &dyn Verifier,
    task: &Task,
    strategy: Strategy,
    feedback: &[String],
    limit: Duration,
) -> Candidate {
    let deadline = Instant::now() + limit;
    let (outcome, elapsed) = timed(timeout_at(
        deadline,
        executor.attempt(task, strategy, feedback),
    ))
    .await;
    let elapsed_ms = millis(elapsed);

    let draft = match outcome {
        Err(_) => Err(ExecutorError::Timeout(limit)),
        Ok(Ok(draft)) if draft.artifact.trim().is_empty() => Err(ExecutorError::EmptyArtifact),
        Ok(result) => result,
    };

    let draft = match draft {
        Ok(draft) => draft,
        Err(err) => {
            warn!(task = %task.id, %strategy, error = %err, "executor attempt failed");
            return Candidate::failed(strategy, err.to_string(), elapsed_ms);
        }
    };

    let mut candidate = Candidate {
        strategy,
        artifact: draft.artifact,
        verification: VerificationReport::pass(),
        elapsed_ms,
        tokens_used: draft.tokens_used,
        error: None,
    };
    let report = match timeout_at(deadline, verifier.verify(&candidate, task)).await {
        Ok(report) => report,
        Err(_) => {
            warn!(task = %task.id, %strategy, "verifier did not finish before the deadline");
            VerificationReport::fail(format!("verification timed out after {:?}", limit))
        }
    };
    candidate.verification = match draft.self_check {
        Some(self_check) => self_check.merge(report),
        None => report,
    };
    debug!(
        task = %task.id,
        %strategy,
        passed = candidate.passed(),
        elapsed_ms,
        "candidate produced"
    );
    candidate
}
