//! Orchestration layer for redundant task execution.
//!
//! Each non-trivial task is attempted by two executor strategies, judged by
//! an evaluator, retried with feedback on rejection and escalated to an
//! external decision-maker when automated judgement is not enough. The
//! [`Orchestrator`] drives a whole task graph through that pipeline.

mod command;
mod escalation;
mod executor;
mod judge;
mod retry;
mod scheduler;

pub use command::{CommandExecutor, CommandScorer, ProcessOutput, ProcessRunner};
pub use escalation::{
    Decision, EscalationError, EscalationGate, EscalationOutcome, EscalationRequest, EscalationSink,
    PolicyDecision, PolicySink, QueueSink, Resolution, SinkResponse,
};
pub use executor::{produce_candidate, AcceptAll, Draft, Executor, ExecutorError, Verifier};
pub use judge::{
    EvaluationError, Evaluator, JudgePolicy, ScoreRequest, ScoreSheet, ScoringBackend,
    EVALUATOR_UNAVAILABLE,
};
pub use retry::{RetryController, RetryDecision, RetryPhase};
pub use scheduler::{Orchestrator, ProgressCallback, ProgressEvent};
