//! Escalation of undecided tasks to an external decision-maker.
//!
//! The `EscalationGate` decides when automated adjudication is not enough
//! (low-confidence accepts, merges, exhausted retries) and hands the task to
//! an [`EscalationSink`]. A sink either answers right away or returns a
//! [`PendingEscalation`] token that the orchestrator polls later; a pending
//! task suspends only its own branch of the graph.
//!
//! Two sinks ship with the crate:
//! - [`PolicySink`] answers on behalf of a human by picking the best verified
//!   candidate, so runs can proceed unattended.
//! - [`QueueSink`] defers every request until someone resolves it by token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::outcome::{
    Candidate, EscalationReason, PendingEscalation, Slot, Verdict, VerdictKind,
};
use crate::core::task::{Task, TaskId};

/// Failure talking to an escalation sink.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EscalationError {
    #[error("escalation sink unavailable: {0}")]
    Unavailable(String),

    #[error("unknown escalation token: {0}")]
    UnknownToken(PendingEscalation),

}

/// What the decision-maker sees.
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    /// The task as last attempted, feedback constraints included.
    pub task: Task,
    pub reason: EscalationReason,
    pub first: Candidate,
    pub second: Candidate,
    /// Every verdict produced for the task, oldest first.
    pub verdicts: Vec<Verdict>,
}

impl EscalationRequest {
    pub fn candidate(&self, slot: Slot) -> &Candidate {
        match slot {
            Slot::First => &self.first,
            Slot::Second => &self.second,
        }
    }

    pub fn latest_verdict(&self) -> Option<&Verdict> {
        self.verdicts.last()
    }
}

/// A decision-maker's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Take one of the two candidates as is.
    Choose(Slot),
    /// Use this artifact instead of either candidate.
    Replace(String),
    /// Give up on the task.
    Reject(String),
}

/// Immediate answer or a token to poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkResponse {
    Resolved(Resolution),
    Pending(PendingEscalation),
}

/// A deferred answer, as returned from [`EscalationSink::poll`].
///
/// By the time a deferred answer arrives the orchestrator no longer holds
/// the candidates, so a `Choose` is only usable when the sink hands back
/// the request it answers.
#[derive(Debug, Clone)]
pub struct Decision {
    pub resolution: Resolution,
    pub request: Option<EscalationRequest>,
}

impl Decision {
    /// A decision that does not refer to the candidates.
    pub fn detached(resolution: Resolution) -> Self {
        Self {
            resolution,
            request: None,
        }
    }
}

/// The external decision-making capability.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, request: &EscalationRequest) -> Result<SinkResponse, EscalationError>;

    /// `Ok(None)` while the decision is still outstanding.
    async fn poll(&self, token: &PendingEscalation) -> Result<Option<Decision>, EscalationError>;
}

/// Outcome of an escalation, as the orchestrator consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    Resolved { artifact: String, resolution: String },
    Rejected(String),
    Pending(PendingEscalation),
    Unavailable(String),
    /// The sink has no record of the token, so polling it again is futile.
    UnknownToken(PendingEscalation),
}

/// Confidence gate plus sink invocation.
#[derive(Clone)]
pub struct EscalationGate {
    sink: Option<Arc<dyn EscalationSink>>,
    threshold: f64,
}

impl EscalationGate {
    pub fn new(sink: Option<Arc<dyn EscalationSink>>, threshold: f64) -> Self {
        Self { sink, threshold }
    }

    /// Escalation reason for an accept verdict that is not confident enough.
    pub fn review(&self, verdict: &Verdict) -> Option<EscalationReason> {
        let accepted = matches!(
            verdict.kind,
            VerdictKind::AcceptFirst | VerdictKind::AcceptSecond
        );
        (accepted && verdict.confidence < self.threshold).then(|| EscalationReason::LowConfidence {
            confidence: verdict.confidence,
            threshold: self.threshold,
        })
    }

    /// Hand `request` to the sink, waiting at most `limit` for an answer.
    pub async fn escalate(&self, request: &EscalationRequest, limit: Duration) -> EscalationOutcome {
        let Some(sink) = &self.sink else {
            return EscalationOutcome::Unavailable("no escalation sink configured".into());
        };
        info!(task = %request.task.id, reason = %request.reason, "escalating task");
        match tokio::time::timeout(limit, sink.escalate(request)).await {
            Err(_) => EscalationOutcome::Unavailable(format!(
                "escalation sink did not answer within {:?}",
                limit
            )),
            Ok(Err(err)) => {
                warn!(task = %request.task.id, error = %err, "escalation failed");
                EscalationOutcome::Unavailable(err.to_string())
            }
            Ok(Ok(SinkResponse::Pending(token))) => {
                info!(task = %request.task.id, %token, "escalation pending");
                EscalationOutcome::Pending(token)
            }
            Ok(Ok(SinkResponse::Resolved(resolution))) => apply(resolution, Some(request)),
        }
    }

    /// Check on a pending escalation.
    ///
    /// Returns `Pending` with the same token while it is still outstanding.
    pub async fn poll(&self, token: &PendingEscalation, limit: Duration) -> EscalationOutcome {
        let Some(sink) = &self.sink else {
            return EscalationOutcome::Unavailable("no escalation sink configured".into());
        };
        match tokio::time::timeout(limit, sink.poll(token)).await {
            Err(_) => EscalationOutcome::Pending(token.clone()),
            Ok(Err(EscalationError::UnknownToken(token))) => EscalationOutcome::UnknownToken(token),
            Ok(Err(err)) => EscalationOutcome::Unavailable(err.to_string()),
            Ok(Ok(None)) => EscalationOutcome::Pending(token.clone()),
            Ok(Ok(Some(decision))) => apply(decision.resolution, decision.request.as_ref()),
        }
    }
}

fn apply(resolution: Resolution, request: Option<&EscalationRequest>) -> EscalationOutcome {
    match (resolution, request) {
        (Resolution::Choose(slot), Some(request)) => {
            let candidate = request.candidate(slot);
            EscalationOutcome::Resolved {
                artifact: candidate.artifact.clone(),
                resolution: format!("chose {} candidate ({})", slot_name(slot), candidate.strategy),
            }
        }
        (Resolution::Choose(slot), None) => EscalationOutcome::Unavailable(format!(
            "chose the {} candidate but the candidates are gone",
            slot_name(slot)
        )),
        (Resolution::Replace(artifact), _) => EscalationOutcome::Resolved {
            artifact,
            resolution: "replaced with an external artifact".into(),
        },
        (Resolution::Reject(reason), _) => EscalationOutcome::Rejected(reason),
    }
}

fn slot_name(slot: Slot) -> &'static str {
    match slot {
        Slot::First => "first",
        Slot::Second => "second",
    }
}

/// Record of a decision taken by [`PolicySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub task_id: TaskId,
    pub reason: EscalationReason,
    pub resolution: Resolution,
}

/// Sink that decides on behalf of a human.
///
/// Picks the verified candidate with the higher score in the latest
/// verdict, provided that score reaches `min_score`. Otherwise it rejects.
/// Every decision is recorded for later inspection.
#[derive(Debug, Default)]
pub struct PolicySink {
    min_score: f64,
    decisions: RwLock<Vec<PolicyDecision>>,
}

impl PolicySink {
    pub fn new(min_score: f64) -> Self {
        Self {
            min_score,
            decisions: RwLock::new(Vec::new()),
        }
    }

    /// Decide without recording.
    pub fn decide(&self, request: &EscalationRequest) -> Resolution {
        let Some(verdict) = request.latest_verdict() else {
            return Resolution::Reject("no verdict to base a decision on".into());
        };
        let best = [Slot::First, Slot::Second]
            .into_iter()
            .filter(|&slot| request.candidate(slot).passed())
            .map(|slot| (slot, verdict.score(slot)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((slot, score)) if score >= self.min_score => Resolution::Choose(slot),
            Some((_, score)) => Resolution::Reject(format!(
                "best verified candidate scored {:.1}, policy requires {:.1}",
                score, self.min_score
            )),
            None => Resolution::Reject("no candidate passed verification".into()),
        }
    }

    pub fn decisions(&self) -> Vec<PolicyDecision> {
        self.decisions.read().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EscalationSink for PolicySink {
    async fn escalate(&self, request: &EscalationRequest) -> Result<SinkResponse, EscalationError> {
        let resolution = self.decide(request);
        if let Ok(mut decisions) = self.decisions.write() {
            decisions.push(PolicyDecision {
                task_id: request.task.id.clone(),
                reason: request.reason.clone(),
                resolution: resolution.clone(),
            });
        }
        Ok(SinkResponse::Resolved(resolution))
    }

    async fn poll(&self, token: &PendingEscalation) -> Result<Option<Decision>, EscalationError> {
        Err(EscalationError::UnknownToken(token.clone()))
    }
}

#[derive(Debug)]
struct QueueEntry {
    request: EscalationRequest,
    resolution: Option<Resolution>,
}

/// Sink that defers every decision until it is resolved by token.
#[derive(Debug, Default)]
pub struct QueueSink {
    entries: Mutex<HashMap<PendingEscalation, QueueEntry>>,
}

impl QueueSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding escalations and the tasks they belong to.
    pub fn pending(&self) -> Vec<(PendingEscalation, TaskId)> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut pending: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.resolution.is_none())
            .map(|(token, e)| (token.clone(), e.request.task.id.clone()))
            .collect();
        pending.sort_by(|a, b| a.1.cmp(&b.1));
        pending
    }

    /// Token of the outstanding escalation for `task_id`, if any.
    pub fn token_for(&self, task_id: &TaskId) -> Option<PendingEscalation> {
        self.pending()
            .into_iter()
            .find(|(_, id)| id == task_id)
            .map(|(token, _)| token)
    }

    /// Record a decision for the escalation behind `token`.
    pub fn resolve(&self, token: &PendingEscalation, resolution: Resolution) -> Result<(), EscalationError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EscalationError::Unavailable("queue lock poisoned".into()))?;
        let entry = entries
            .get_mut(token)
            .ok_or_else(|| EscalationError::UnknownToken(token.clone()))?;
        entry.resolution = Some(resolution);
        Ok(())
    }
}

#[async_trait]
impl EscalationSink for QueueSink {
    async fn escalate(&self, request: &EscalationRequest) -> Result<SinkResponse, EscalationError> {
        let token = PendingEscalation(Uuid::new_v4().to_string());
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EscalationError::Unavailable("queue lock poisoned".into()))?;
        entries.insert(
            token.clone(),
            QueueEntry {
                request: request.clone(),
                resolution: None,
            },
        );
        Ok(SinkResponse::Pending(token))
    }

    async fn poll(&self, token: &PendingEscalation) -> Result<Option<Decision>, EscalationError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EscalationError::Unavailable("queue lock poisoned".into()))?;
        let entry = entries
            .get(token)
            .ok_or_else(|| EscalationError::UnknownToken(token.clone()))?;
        if entry.resolution.is_none() {
            return Ok(None);
        }
        Ok(entries.remove(token).and_then(|entry| {
            entry.resolution.map(|resolution| Decision {
                resolution,
                request: Some(entry.request),
            })
        }))
    }
}
