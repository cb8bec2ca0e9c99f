//! Orchestrator for redundant task execution.
//!
//! The orchestrator walks the task graph in dependency order. Every ready
//! task runs in its own branch: two executor strategies in parallel, the
//! evaluator, and the retry and escalation logic. Branches report finished
//! results over a channel to the run loop, which is the only place that
//! touches the [`Schedule`], writes results to the store and fires progress
//! callbacks.
//!
//! A run ends when nothing can make progress, when it is cancelled, or when
//! the global deadline elapses. The summary always holds one result per
//! task; tasks that never started are reported as `skipped`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StrategyPair, TierTimeouts};
use crate::core::dag::{Schedule, TaskGraph};
use crate::core::outcome::{
    Candidate, EscalationReason, ExecutionResult, ExecutionStatus, PendingEscalation, RunId,
    RunSummary, Slot, Strategy,
};
use crate::core::task::{Task, TaskId};
use crate::orchestration::escalation::{
    EscalationGate, EscalationOutcome, EscalationRequest, EscalationSink,
};
use crate::orchestration::executor::{produce_candidate, AcceptAll, Executor, Verifier};
use crate::orchestration::judge::{Evaluator, JudgePolicy, ScoringBackend};
use crate::orchestration::retry::{RetryController, RetryDecision};
use crate::state::{aggregate, StateStore, TraceEvent, TraceKind};
use crate::util::{millis, timed};
use crate::Result;

/// Progress notification, fired once per task terminal transition.
///
/// A resolved escalation fires again with its new status.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A task completed with an accepted artifact.
    TaskCompleted {
        task_id: TaskId,
        /// Executor rounds used.
        attempts: u32,
    },
    /// A task failed without escalation (simple tasks, branch panics).
    TaskFailed { task_id: TaskId, detail: String },
    /// A task was handed to an external decision-maker.
    TaskEscalated {
        task_id: TaskId,
        reason: EscalationReason,
        /// Whether a decision is still outstanding.
        pending: bool,
    },
    /// An external decision-maker rejected the task.
    TaskRejected { task_id: TaskId, reason: String },
}

impl ProgressEvent {
    fn from_result(result: &ExecutionResult) -> Option<Self> {
        let task_id = result.task_id.clone();
        let event = match result.status {
            ExecutionStatus::Completed => ProgressEvent::TaskCompleted {
                task_id,
                attempts: result.attempts,
            },
            ExecutionStatus::Failed => ProgressEvent::TaskFailed {
                task_id,
                detail: result.detail.clone().unwrap_or_default(),
            },
            ExecutionStatus::Escalated => ProgressEvent::TaskEscalated {
                task_id,
                reason: result.escalation.as_ref()?.reason.clone(),
                pending: result.pending_escalation().is_some(),
            },
            ExecutionStatus::Rejected => ProgressEvent::TaskRejected {
                task_id,
                reason: result
                    .escalation
                    .as_ref()
                    .and_then(|e| e.resolution.clone())
                    .unwrap_or_default(),
            },
            ExecutionStatus::Skipped => return None,
        };
        Some(event)
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            ProgressEvent::TaskCompleted { task_id, .. }
            | ProgressEvent::TaskFailed { task_id, .. }
            | ProgressEvent::TaskEscalated { task_id, .. }
            | ProgressEvent::TaskRejected { task_id, .. } => task_id,
        }
    }
}

/// Caller-supplied progress hook. Panics are caught and logged.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Drives a task graph to completion.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use duet::{Config, JsonStateStore, Orchestrator, RunId, TaskGraph};
///
/// let orchestrator = Orchestrator::new(config, executor, scorer, store)?
///     .with_sink(Arc::new(PolicySink::new(70.0)))
///     .on_progress(|event| println!("{:?}", event));
/// let summary = orchestrator
///     .run(&graph, RunId::new(), CancellationToken::new())
///     .await?;
/// ```
pub struct Orchestrator {
    config: Config,
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn Verifier>,
    evaluator: Arc<Evaluator>,
    gate: EscalationGate,
    store: Arc<dyn StateStore>,
    progress: Option<ProgressCallback>,
}

impl Orchestrator {
    /// Create an orchestrator with the default verifier and no escalation
    /// sink.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        config: Config,
        executor: Arc<dyn Executor>,
        scorer: Arc<dyn ScoringBackend>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let evaluator = Arc::new(Evaluator::new(scorer, JudgePolicy::from(&config)));
        let gate = EscalationGate::new(None, config.confidence_escalation_threshold);
        Ok(Self {
            config,
            executor,
            verifier: Arc::new(AcceptAll),
            evaluator,
            gate,
            store,
            progress: None,
        })
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.gate = EscalationGate::new(Some(sink), self.config.confidence_escalation_threshold);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute `graph` as run `run_id`.
    ///
    /// Results already recorded for `run_id` are reused: completed, failed
    /// and rejected tasks are not run again, and pending escalations are
    /// polled before anything else starts.
    ///
    /// # Errors
    ///
    /// Only state store failures and scheduler contract violations abort a
    /// run; per-task failures end up in the summary.
    pub async fn run(
        &self,
        graph: &TaskGraph,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        info!(run = %run_id.short(), tasks = graph.len(), "run started");

        let mut state = RunState {
            schedule: graph.schedule(),
            results: HashMap::new(),
            pending: HashMap::new(),
        };
        self.restore(graph, &run_id, &mut state).await?;
        self.poll_pending(graph, &run_id, &mut state).await?;

        let runner = Arc::new(TaskRunner {
            run_id,
            executor: Arc::clone(&self.executor),
            verifier: Arc::clone(&self.verifier),
            evaluator: Arc::clone(&self.evaluator),
            gate: self.gate.clone(),
            store: Arc::clone(&self.store),
            strategies: self.config.strategies,
            timeouts: self.config.timeouts.clone(),
            max_retries: self.config.max_retries,
        });

        let max_parallel = self.config.max_parallel;
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let (tx, mut rx) = mpsc::channel::<ExecutionResult>(max_parallel.max(1) * 2);
        let mut branches = JoinSet::new();
        let deadline = self.config.run_deadline().map(|d| Instant::now() + d);
        let poll_interval = self.config.escalation_poll_interval();
        let mut cancelled = false;
        let mut deadline_elapsed = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                deadline_elapsed = true;
                break;
            }

            for task in state.schedule.ready_batch() {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let outputs = state.schedule.dependency_outputs(&task.id)?;
                let prepared = task.with_dependency_outputs(&outputs);
                state.schedule.mark_running(&task.id);
                debug!(task = %task.id, "task launched");

                let runner = Arc::clone(&runner);
                let tx = tx.clone();
                branches.spawn(async move {
                    let task_id = prepared.id.clone();
                    let result = match AssertUnwindSafe(runner.execute(prepared))
                        .catch_unwind()
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            error!(task = %task_id, "task branch panicked");
                            ExecutionResult::failed(task_id, "task branch panicked", 0, Vec::new())
                        }
                    };
                    // Release the slot before the loop can observe the result.
                    drop(permit);
                    report(&tx, result).await;
                });
            }

            let polling = !state.pending.is_empty() && poll_interval.is_some();
            if state.schedule.running_count() == 0 {
                // Nothing left to wait for except outstanding escalations.
                // Pick up decisions already taken, then settle on the rest.
                if polling && self.poll_pending(graph, &run_id, &mut state).await? > 0 {
                    continue;
                }
                break;
            }

            let poll_wait = poll_interval.filter(|_| polling);
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = wait_until(deadline) => {
                    deadline_elapsed = true;
                    break;
                }
                Some(result) = rx.recv() => {
                    self.record(&run_id, &mut state, result).await?;
                }
                _ = wait_for(poll_wait) => {
                    self.poll_pending(graph, &run_id, &mut state).await?;
                }
                Some(joined) = branches.join_next(), if !branches.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "task branch ended abnormally");
                    }
                }
            }
        }

        if cancelled || deadline_elapsed {
            warn!(
                run = %run_id.short(),
                cancelled,
                deadline_elapsed,
                in_flight = state.schedule.running_count(),
                "run interrupted, aborting in-flight tasks"
            );
            branches.shutdown().await;
        }
        drop(tx);
        // Branches that finished before the interruption still count.
        while let Ok(result) = rx.try_recv() {
            self.record(&run_id, &mut state, result).await?;
        }

        let skip_reason = if cancelled {
            Some("run cancelled")
        } else if deadline_elapsed {
            Some("run deadline elapsed")
        } else {
            None
        };
        let results = graph
            .tasks()
            .map(|task| match state.results.get(&task.id) {
                Some(result) => result.clone(),
                None => ExecutionResult::skipped(
                    task.id.clone(),
                    skip_detail(&state.schedule, &task.id, skip_reason),
                ),
            })
            .collect();

        let traces = self.store.load_traces(&run_id).await?;
        let summary = RunSummary {
            run_id,
            results,
            cancelled,
            deadline_elapsed,
            started_at,
            finished_at: Utc::now(),
            stats: aggregate(&traces),
        };
        self.store.save_summary(&summary).await?;
        info!(
            run = %run_id.short(),
            completed = summary.count(ExecutionStatus::Completed),
            failed = summary.count(ExecutionStatus::Failed),
            escalated = summary.count(ExecutionStatus::Escalated),
            rejected = summary.count(ExecutionStatus::Rejected),
            skipped = summary.count(ExecutionStatus::Skipped),
            executor_calls = summary.stats.executor_calls(),
            tokens = summary.stats.tokens_used(),
            "run finished"
        );
        Ok(summary)
    }

    /// Load prior records for the run into the schedule.
    async fn restore(&self, graph: &TaskGraph, run_id: &RunId, state: &mut RunState<'_>) -> Result<()> {
        let prior = self.store.load_run(run_id).await?;
        if !prior.is_empty() {
            info!(run = %run_id.short(), records = prior.len(), "resuming run");
        }
        for result in prior {
            if !graph.contains(&result.task_id) {
                warn!(task = %result.task_id, "recorded task is not in the graph, ignoring");
                continue;
            }
            state.apply(&result);
            state.results.insert(result.task_id.clone(), result);
        }
        Ok(())
    }

    /// Poll every pending escalation once; record the resolved ones.
    ///
    /// Tokens the sink does not know are dropped from the run's polling set
    /// and the task stays escalated. Returns how many escalations resolved.
    async fn poll_pending(&self, graph: &TaskGraph, run_id: &RunId, state: &mut RunState<'_>) -> Result<usize> {
        let pending: Vec<(TaskId, PendingEscalation)> = state
            .pending
            .iter()
            .map(|(id, token)| (id.clone(), token.clone()))
            .collect();

        let mut resolved_count = 0;
        for (task_id, token) in pending {
            let limit = graph
                .get(&task_id)
                .map(|t| self.config.timeout_for(t.criticality))
                .unwrap_or_else(|| self.config.timeout_for(Default::default()));
            let Some(prior) = state.results.get(&task_id).cloned() else {
                continue;
            };
            let resolved = match self.gate.poll(&token, limit).await {
                EscalationOutcome::Pending(_) => continue,
                EscalationOutcome::Unavailable(reason) => {
                    warn!(task = %task_id, %token, %reason, "could not poll escalation");
                    continue;
                }
                EscalationOutcome::UnknownToken(_) => {
                    warn!(task = %task_id, %token, "escalation sink does not know the token, task stays escalated");
                    state.pending.remove(&task_id);
                    continue;
                }
                EscalationOutcome::Resolved {
                    artifact,
                    resolution,
                } => prior.resolve(Some(artifact), resolution),
                EscalationOutcome::Rejected(reason) => prior.resolve(None, reason),
            };
            info!(task = %task_id, status = %resolved.status, "escalation resolved");
            self.record(run_id, state, resolved).await?;
            resolved_count += 1;
        }
        Ok(resolved_count)
    }

    /// Persist a terminal result, update bookkeeping and notify.
    async fn record(&self, run_id: &RunId, state: &mut RunState<'_>, result: ExecutionResult) -> Result<()> {
        self.store.append_result(run_id, &result).await?;
        state.apply(&result);
        info!(
            task = %result.task_id,
            status = %result.status,
            attempts = result.attempts,
            "task finished"
        );
        self.notify(&result);
        state.results.insert(result.task_id.clone(), result);
        Ok(())
    }

    fn notify(&self, result: &ExecutionResult) {
        let (Some(callback), Some(event)) = (&self.progress, ProgressEvent::from_result(result)) else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
            warn!(task = %result.task_id, "progress callback panicked");
        }
    }
}

/// Mutable state of one run, owned by the run loop.
struct RunState<'g> {
    schedule: Schedule<'g>,
    results: HashMap<TaskId, ExecutionResult>,
    pending: HashMap<TaskId, PendingEscalation>,
}

impl RunState<'_> {
    fn apply(&mut self, result: &ExecutionResult) {
        let id = &result.task_id;
        match result.status {
            ExecutionStatus::Completed => {
                let artifact = result.artifact.clone().unwrap_or_default();
                self.schedule.mark_completed(id, artifact);
                self.pending.remove(id);
            }
            ExecutionStatus::Escalated => {
                if let Some(token) = result.pending_escalation() {
                    self.pending.insert(id.clone(), token.clone());
                }
                self.schedule.mark_settled(id);
            }
            ExecutionStatus::Failed | ExecutionStatus::Rejected => {
                self.schedule.mark_settled(id);
                self.pending.remove(id);
            }
            ExecutionStatus::Skipped => self.schedule.clear_running(id),
        }
    }
}

fn skip_detail(schedule: &Schedule<'_>, id: &TaskId, interrupted: Option<&str>) -> String {
    match (interrupted, schedule.blocking_dependency(id)) {
        (Some(reason), _) => reason.to_string(),
        (None, Some(dep)) => format!("dependency {} did not complete", dep),
        (None, None) => "not started".to_string(),
    }
}

/// Hand a branch result to the run loop. Returns whether it was delivered.
async fn report(tx: &mpsc::Sender<ExecutionResult>, result: ExecutionResult) -> bool {
    match tx.send(result).await {
        Ok(()) => true,
        Err(err) => {
            warn!(task = %err.0.task_id, "run loop gone, dropping task result");
            false
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for(interval: Option<std::time::Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

/// Everything a task branch needs, shared across branches of one run.
struct TaskRunner {
    run_id: RunId,
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn Verifier>,
    evaluator: Arc<Evaluator>,
    gate: EscalationGate,
    store: Arc<dyn StateStore>,
    strategies: StrategyPair,
    timeouts: TierTimeouts,
    max_retries: u32,
}

impl TaskRunner {
    async fn execute(self: Arc<Self>, task: Task) -> ExecutionResult {
        info!(task = %task.id, criticality = %task.criticality, "task started");
        if task.criticality.is_adjudicated() {
            self.adjudicate(task).await
        } else {
            self.single(task).await
        }
    }

    /// Simple tasks: primary strategy only, no evaluator.
    async fn single(&self, task: Task) -> ExecutionResult {
        let candidate = self.candidate(&task, self.strategies.primary, &[], 1).await;
        if candidate.passed() {
            return ExecutionResult::completed(task.id, candidate.artifact, 1, Vec::new());
        }
        let detail = candidate.error.clone().unwrap_or_else(|| {
            format!(
                "verification failed: {}",
                candidate.verification.diagnostics.join("; ")
            )
        });
        ExecutionResult::failed(task.id, detail, 1, Vec::new())
    }

    async fn adjudicate(&self, task: Task) -> ExecutionResult {
        let limit = self.timeouts.for_tier(task.criticality);
        let mut retry = RetryController::new(task, self.max_retries);

        loop {
            let task = retry.begin_attempt().clone();
            let feedback = retry.feedback().to_vec();
            let attempt = retry.attempts();

            let (first, second) = tokio::join!(
                self.candidate(&task, self.strategies.primary, &feedback, attempt),
                self.candidate(&task, self.strategies.secondary, &feedback, attempt),
            );

            let (evaluation, elapsed) =
                timed(self.evaluator.evaluate(&task, &first, &second, limit)).await;
            self.trace(
                &task.id,
                TraceKind::EvaluatorCall {
                    profile: self.evaluator.profile_for(&task).to_string(),
                    attempt,
                    elapsed_ms: millis(elapsed),
                    verdict: evaluation.as_ref().ok().map(|v| v.kind),
                    error: evaluation.as_ref().err().map(ToString::to_string),
                },
            )
            .await;

            let decision = match evaluation {
                Ok(verdict) => {
                    let low_confidence = self.gate.review(&verdict);
                    match (retry.on_verdict(verdict), low_confidence) {
                        (RetryDecision::Accept(_), Some(reason)) => RetryDecision::Escalate(reason),
                        (decision, _) => decision,
                    }
                }
                Err(err) => {
                    warn!(task = %task.id, error = %err, "evaluation failed");
                    retry.on_evaluation_error(&err)
                }
            };
            debug!(task = %task.id, attempt, phase = ?retry.phase(), "attempt adjudicated");

            match decision {
                RetryDecision::Accept(slot) => {
                    let artifact = match slot {
                        Slot::First => first.artifact,
                        Slot::Second => second.artifact,
                    };
                    let attempts = retry.attempts();
                    return ExecutionResult::completed(task.id, artifact, attempts, retry.into_verdicts());
                }
                RetryDecision::Retry { .. } => continue,
                RetryDecision::Escalate(reason) => {
                    return self.escalate(retry, reason, first, second, limit).await;
                }
            }
        }
    }

    async fn escalate(
        &self,
        retry: RetryController,
        reason: EscalationReason,
        first: Candidate,
        second: Candidate,
        limit: std::time::Duration,
    ) -> ExecutionResult {
        let attempts = retry.attempts();
        let task = retry.task().clone();
        let request = EscalationRequest {
            task,
            reason: reason.clone(),
            first,
            second,
            verdicts: retry.into_verdicts(),
        };
        let outcome = self.gate.escalate(&request, limit).await;
        let task_id = request.task.id.clone();
        let verdicts = request.verdicts;

        let (result, described) = match outcome {
            EscalationOutcome::Resolved {
                artifact,
                resolution,
            } => (
                ExecutionResult::escalated(task_id.clone(), reason.clone(), None, None, attempts, verdicts)
                    .resolve(Some(artifact), resolution.clone()),
                resolution,
            ),
            EscalationOutcome::Rejected(why) => (
                ExecutionResult::escalated(task_id.clone(), reason.clone(), None, None, attempts, verdicts)
                    .resolve(None, why.clone()),
                format!("rejected: {}", why),
            ),
            EscalationOutcome::Pending(token) => (
                ExecutionResult::escalated(
                    task_id.clone(),
                    reason.clone(),
                    Some(token.clone()),
                    None,
                    attempts,
                    verdicts,
                ),
                format!("pending: {}", token),
            ),
            EscalationOutcome::Unavailable(why) => (
                ExecutionResult::escalated(
                    task_id.clone(),
                    reason.clone(),
                    None,
                    Some(why.clone()),
                    attempts,
                    verdicts,
                ),
                format!("unavailable: {}", why),
            ),
            EscalationOutcome::UnknownToken(token) => (
                ExecutionResult::escalated(
                    task_id.clone(),
                    reason.clone(),
                    None,
                    Some(format!("unknown escalation token {}", token)),
                    attempts,
                    verdicts,
                ),
                format!("unknown token: {}", token),
            ),
        };
        self.trace(
            &task_id,
            TraceKind::Escalation {
                reason: reason.to_string(),
                outcome: described,
            },
        )
        .await;
        result
    }

    async fn candidate(
        &self,
        task: &Task,
        strategy: Strategy,
        feedback: &[String],
        attempt: u32,
    ) -> Candidate {
        let limit = self.timeouts.for_tier(task.criticality);
        let candidate = produce_candidate(
            self.executor.as_ref(),
            self.verifier.as_ref(),
            task,
            strategy,
            feedback,
            limit,
        )
        .await;
        self.trace(
            &task.id,
            TraceKind::ExecutorCall {
                strategy,
                attempt,
                elapsed_ms: candidate.elapsed_ms,
                tokens_used: candidate.tokens_used,
                passed: candidate.passed(),
                error: candidate.error.clone(),
            },
        )
        .await;
        candidate
    }

    async fn trace(&self, task_id: &TaskId, kind: TraceKind) {
        let event = TraceEvent::new(self.run_id, task_id.clone(), kind);
        if let Err(err) = self.store.append_trace(&event).await {
            warn!(task = %task_id, error = %err, "failed to record trace");
        }
    }
}
