//! Evaluator for candidate pairs.
//!
//! The `Evaluator` asks a [`ScoringBackend`] for per-criterion scores,
//! combines them with the configured weights, and turns the two weighted
//! totals into a [`Verdict`]. Verdict selection is deterministic given the
//! scores; only the scoring itself is delegated.
//!
//! ## Decision rules
//!
//! - A candidate that failed verification is never accepted.
//! - `AcceptFirst`/`AcceptSecond`: the eligible winner reaches the floor and
//!   leads by at least the margin, or the other candidate is ineligible.
//! - `Merge`: both eligible, both at or above the floor, neither dominates.
//! - `RejectBoth`: anything else. Feedback is always non-empty.
//!
//! Both candidates failing verification short-circuits to `RejectBoth`
//! without calling the backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, EvaluatorProfiles};
use crate::core::outcome::{Candidate, CriterionScore, Slot, Verdict, VerdictKind};
use crate::core::task::Task;

/// Score gap (0-100 scale) at which separation confidence saturates.
const SEPARATION_SPAN: f64 = 20.0;

const BASE_CONFIDENCE: f64 = 0.4;
const SEPARATION_WEIGHT: f64 = 0.4;
/// Verification outcomes single out the winner.
const VERIFICATION_AGREES: f64 = 0.2;
/// Both candidates verified; verification does not discriminate.
const VERIFICATION_NEUTRAL: f64 = 0.1;

/// Feedback used when the scoring backend fails.
pub const EVALUATOR_UNAVAILABLE: &str = "evaluator unavailable";

/// Failure of the scoring capability.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("scoring backend unavailable: {0}")]
    Unavailable(String),

    #[error("score sheet is missing criterion '{criterion}' for the {slot:?} candidate")]
    MissingCriterion { criterion: String, slot: Slot },

    #[error("malformed score sheet: {0}")]
    Malformed(String),

    #[error("scoring timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything the scoring backend sees for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRequest<'a> {
    /// Evaluator profile name; critical tasks use the high-trust profile.
    pub profile: &'a str,
    pub task: &'a Task,
    pub first: &'a Candidate,
    pub second: &'a Candidate,
    /// Criterion name to weight.
    pub criteria: &'a BTreeMap<String, f64>,
}

/// Raw per-criterion scores (0-100) returned by a scoring backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreSheet {
    pub first: BTreeMap<String, f64>,
    pub second: BTreeMap<String, f64>,
    #[serde(default)]
    pub rationale: String,
    /// Suggestions for the next attempt.
    #[serde(default)]
    pub feedback: Vec<String>,
    /// The backend's own confidence, if it reports one. Caps the derived
    /// confidence.
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl ScoreSheet {
    /// Sheet giving every criterion the same score for each candidate.
    pub fn uniform<'a>(criteria: impl IntoIterator<Item = &'a String>, first: f64, second: f64) -> Self {
        let mut sheet = Self::default();
        for name in criteria {
            sheet.first.insert(name.clone(), first);
            sheet.second.insert(name.clone(), second);
        }
        sheet
    }
}

/// The scoring capability.
#[async_trait]
pub trait ScoringBackend: Send + Sync {
    async fn score(&self, request: &ScoreRequest<'_>) -> Result<ScoreSheet, EvaluationError>;
}

/// Thresholds and weights used to turn scores into a verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgePolicy {
    pub weights: BTreeMap<String, f64>,
    pub rejection_score_floor: f64,
    pub accept_margin: f64,
    pub evaluators: EvaluatorProfiles,
}

impl From<&Config> for JudgePolicy {
    fn from(config: &Config) -> Self {
        Self {
            weights: config.weights.clone(),
            rejection_score_floor: config.rejection_score_floor,
            accept_margin: config.accept_margin,
            evaluators: config.evaluators.clone(),
        }
    }
}

impl Default for JudgePolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl JudgePolicy {
    /// Pick the verdict kind and confidence for two weighted totals.
    ///
    /// `*_passed` is each candidate's verification outcome.
    pub fn decide(
        &self,
        first_score: f64,
        first_passed: bool,
        second_score: f64,
        second_passed: bool,
    ) -> (VerdictKind, f64) {
        let floor = self.rejection_score_floor;
        let gap = (first_score - second_score).abs();
        let separation = (gap / SEPARATION_SPAN).min(1.0);
        let both_passed = first_passed && second_passed;

        let (leader, leader_score, leader_passed, other_passed) = if first_score >= second_score {
            (Slot::First, first_score, first_passed, second_passed)
        } else {
            (Slot::Second, second_score, second_passed, first_passed)
        };

        // The only verified candidate wins if it clears the floor.
        let sole = match (first_passed, second_passed) {
            (true, false) => Some((Slot::First, first_score)),
            (false, true) => Some((Slot::Second, second_score)),
            _ => None,
        };

        let kind = if let Some((slot, score)) = sole {
            if score >= floor {
                accept(slot)
            } else {
                VerdictKind::RejectBoth
            }
        } else if both_passed && leader_score >= floor && gap >= self.accept_margin {
            accept(leader)
        } else if both_passed && first_score.min(second_score) >= floor {
            VerdictKind::Merge
        } else {
            VerdictKind::RejectBoth
        };

        let verification_term = match kind {
            VerdictKind::AcceptFirst | VerdictKind::AcceptSecond if sole.is_some() => {
                VERIFICATION_AGREES
            }
            _ if both_passed => VERIFICATION_NEUTRAL,
            _ => 0.0,
        };
        let spread_term = match kind {
            VerdictKind::Merge if self.accept_margin > 0.0 => {
                (1.0 - gap / self.accept_margin).clamp(0.0, 1.0)
            }
            VerdictKind::Merge => 1.0,
            _ => separation,
        };
        debug!(?leader, leader_passed, other_passed, gap, ?kind, "verdict decided");
        let confidence =
            (BASE_CONFIDENCE + SEPARATION_WEIGHT * spread_term + verification_term).clamp(0.0, 1.0);
        (kind, confidence)
    }
}

fn accept(slot: Slot) -> VerdictKind {
    match slot {
        Slot::First => VerdictKind::AcceptFirst,
        Slot::Second => VerdictKind::AcceptSecond,
    }
}

/// Weighted-criterion evaluator over a scoring backend.
pub struct Evaluator {
    backend: Arc<dyn ScoringBackend>,
    policy: JudgePolicy,
}

impl Evaluator {
    pub fn new(backend: Arc<dyn ScoringBackend>, policy: JudgePolicy) -> Self {
        Self { backend, policy }
    }

    /// Evaluator profile used for `task`.
    pub fn profile_for(&self, task: &Task) -> &str {
        self.policy.evaluators.for_tier(task.criticality)
    }

    /// Judge two candidates for `task`, giving the backend at most `limit`.
    pub async fn evaluate(
        &self,
        task: &Task,
        first: &Candidate,
        second: &Candidate,
        limit: Duration,
    ) -> Result<Verdict, EvaluationError> {
        if !first.passed() && !second.passed() {
            info!(task = %task.id, "both candidates failed verification, skipping scoring");
            return Ok(Verdict::rejection(
                "both candidates failed verification",
                verification_feedback(first, second),
                1.0,
            ));
        }

        let profile = self.profile_for(task);
        let request = ScoreRequest {
            profile,
            task,
            first,
            second,
            criteria: &self.policy.weights,
        };
        let sheet = tokio::time::timeout(limit, self.backend.score(&request))
            .await
            .map_err(|_| EvaluationError::Timeout(limit))??;

        let breakdown = self.breakdown(&sheet)?;
        let first_score: f64 = breakdown.iter().map(|c| c.weight * c.first).sum();
        let second_score: f64 = breakdown.iter().map(|c| c.weight * c.second).sum();

        let (kind, derived) =
            self.policy
                .decide(first_score, first.passed(), second_score, second.passed());
        let confidence = match sheet.confidence {
            Some(reported) if reported.is_finite() => derived.min(reported.clamp(0.0, 1.0)),
            _ => derived,
        };

        let feedback = match kind {
            VerdictKind::RejectBoth => self.rejection_feedback(&sheet, &breakdown, first, second),
            _ => sheet.feedback.clone(),
        };

        info!(
            task = %task.id,
            profile,
            verdict = %kind,
            first_score,
            second_score,
            confidence,
            "evaluation complete"
        );

        Ok(Verdict {
            kind,
            confidence,
            first_score,
            second_score,
            breakdown,
            reasoning: sheet.rationale,
            feedback,
            evaluator: profile.to_string(),
        })
    }

    fn breakdown(&self, sheet: &ScoreSheet) -> Result<Vec<CriterionScore>, EvaluationError> {
        self.policy
            .weights
            .iter()
            .map(|(name, &weight)| {
                Ok(CriterionScore {
                    name: name.clone(),
                    weight,
                    first: criterion(&sheet.first, name, Slot::First)?,
                    second: criterion(&sheet.second, name, Slot::Second)?,
                })
            })
            .collect()
    }

    fn rejection_feedback(
        &self,
        sheet: &ScoreSheet,
        breakdown: &[CriterionScore],
        first: &Candidate,
        second: &Candidate,
    ) -> Vec<String> {
        let mut feedback = sheet.feedback.clone();
        if feedback.is_empty() {
            let floor = self.policy.rejection_score_floor;
            feedback.extend(
                breakdown
                    .iter()
                    .filter(|c| c.first.max(c.second) < floor)
                    .map(|c| {
                        format!(
                            "improve {} (best score {:.0}, {:.0} required)",
                            c.name,
                            c.first.max(c.second),
                            floor
                        )
                    }),
            );
            feedback.extend(diagnostic_lines(first, second));
        }
        if feedback.is_empty() {
            feedback.push(format!(
                "neither candidate reached the acceptance score of {:.0}",
                self.policy.rejection_score_floor
            ));
        }
        feedback
    }
}

fn criterion(scores: &BTreeMap<String, f64>, name: &str, slot: Slot) -> Result<f64, EvaluationError> {
    let score = scores
        .get(name)
        .copied()
        .ok_or_else(|| EvaluationError::MissingCriterion {
            criterion: name.to_string(),
            slot,
        })?;
    if !score.is_finite() {
        return Err(EvaluationError::Malformed(format!(
            "score for '{}' is not a number",
            name
        )));
    }
    Ok(score.clamp(0.0, 100.0))
}

/// Verification diagnostics of failed candidates, tagged with the strategy.
fn diagnostic_lines(first: &Candidate, second: &Candidate) -> Vec<String> {
    [first, second]
        .into_iter()
        .filter(|c| !c.passed())
        .flat_map(|c| {
            c.verification
                .diagnostics
                .iter()
                .map(move |d| format!("{}: {}", c.strategy, d))
        })
        .collect()
}

/// Feedback for a pair that both failed verification.
fn verification_feedback(first: &Candidate, second: &Candidate) -> Vec<String> {
    let feedback = diagnostic_lines(first, second);
    if feedback.is_empty() {
        vec!["both candidates failed verification".to_string()]
    } else {
        feedback
    }
}
