//! Dual-strategy adjudication tests.
//!
//! Scores are uniform across criteria, so the weighted total of a candidate
//! equals its scripted score.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use duet::core::{
    Criticality, EscalationReason, ExecutionStatus, RunId, Strategy, TaskGraph, TaskId,
    VerdictKind,
};
use duet::orchestration::{PolicySink, Resolution};
use duet::MemoryStateStore;

use crate::fixtures::{
    orchestrator, test_config, test_task, Score, ScriptedExecutor, ScriptedScorer, Step,
};

fn single(id: &str, criticality: Criticality) -> TaskGraph {
    TaskGraph::build(vec![test_task(id).with_criticality(criticality)]).unwrap()
}

/// Test: Clear winner
/// Given both candidates verified and scored 90 / 60
/// When the task is adjudicated
/// Then the first candidate is accepted on the first attempt
#[tokio::test]
async fn test_clear_winner_accepted() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    scorer.always("T-1", Score::Pair(90.0, 60.0));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&single("T-1", Criticality::Standard), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.artifact.as_deref(), Some("T-1/pragmatic"));
    assert_eq!(result.attempts, 1);
    assert!(result.escalation.is_none());

    let verdict = &result.verdicts[0];
    assert_eq!(verdict.kind, VerdictKind::AcceptFirst);
    assert!((verdict.first_score - 90.0).abs() < 1e-9);
    assert!((verdict.second_score - 60.0).abs() < 1e-9);
    assert!(verdict.confidence >= 0.6);

    // Both strategies ran once each, in parallel.
    let strategies: Vec<Strategy> = executor.calls().iter().map(|c| c.strategy).collect();
    assert_eq!(strategies.len(), 2);
    assert!(strategies.contains(&Strategy::Pragmatic));
    assert!(strategies.contains(&Strategy::Comprehensive));
}

/// Test: Second candidate wins
/// Given scores of 60 / 90
/// When the task is adjudicated
/// Then the second strategy's artifact is the result
#[tokio::test]
async fn test_second_candidate_accepted() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    scorer.always("T-1", Score::Pair(60.0, 90.0));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&single("T-1", Criticality::Important), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.artifact.as_deref(), Some("T-1/comprehensive"));
    assert_eq!(result.verdicts[0].kind, VerdictKind::AcceptSecond);
}

/// Test: Close scores escalate as a merge
/// Given both candidates verified and scored 85 / 83
/// When the task is adjudicated with a policy sink
/// Then the verdict is MERGE, the task is escalated, and the policy picks
/// the higher-scored candidate
#[tokio::test]
async fn test_close_scores_merge_and_escalate() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    scorer.always("T-1", Score::Pair(85.0, 83.0));
    let sink = Arc::new(PolicySink::new(70.0));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()))
        .with_sink(sink.clone());

    let summary = orch
        .run(&single("T-1", Criticality::Standard), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.verdicts.len(), 1);
    assert_eq!(result.verdicts[0].kind, VerdictKind::Merge);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.artifact.as_deref(), Some("T-1/pragmatic"));

    let escalation = result.escalation.as_ref().unwrap();
    assert_eq!(escalation.reason, EscalationReason::MergeRequested);
    assert!(escalation.resolution.as_deref().unwrap().contains("first"));

    let decisions = sink.decisions();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].resolution, Resolution::Choose(duet::core::Slot::First));
}

/// Test: Merge without a sink
/// Given scores of 85 / 83 and no escalation sink
/// When the task is adjudicated
/// Then the task ends escalated with no pending token
#[tokio::test]
async fn test_merge_without_sink_stays_escalated() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    scorer.always("T-1", Score::Pair(85.0, 83.0));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&single("T-1", Criticality::Standard), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Escalated);
    assert!(result.artifact.is_none());
    assert!(result.pending_escalation().is_none());
    assert!(result.detail.as_deref().unwrap().contains("no escalation sink"));
}

/// Test: Both candidates fail verification
/// Given both strategies always produce unverified drafts
/// When the task is adjudicated
/// Then the scorer is never called and retries run out into an escalation
#[tokio::test]
async fn test_both_unverified_short_circuits_scoring() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("T-1", Strategy::Pragmatic, Step::Unverified("a".into()));
    executor.always("T-1", Strategy::Comprehensive, Step::Unverified("b".into()));
    let config = test_config();
    let max_retries = config.max_retries;
    let orch = orchestrator(config, &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&single("T-1", Criticality::Standard), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(scorer.call_count(), 0);
    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Escalated);
    assert_eq!(result.attempts, max_retries + 1);
    assert!(result
        .verdicts
        .iter()
        .all(|v| v.kind == VerdictKind::RejectBoth && (v.confidence - 1.0).abs() < 1e-9));
}

/// Test: Only one candidate verified
/// Given the first strategy errors and the second scores 85
/// When the task is adjudicated
/// Then the verified second candidate is accepted
#[tokio::test]
async fn test_sole_verified_candidate_accepted() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("T-1", Strategy::Pragmatic, Step::Fail("rate limited".into()));
    scorer.always("T-1", Score::Pair(40.0, 85.0));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&single("T-1", Criticality::Standard), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.artifact.as_deref(), Some("T-1/comprehensive"));
    assert_eq!(result.verdicts[0].kind, VerdictKind::AcceptSecond);
}

/// Test: Critical tasks use the high-trust evaluator
/// Given one critical and one standard task
/// When both are adjudicated
/// Then each is scored under its tier's profile
#[tokio::test]
async fn test_critical_routed_to_high_trust_profile() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let config = test_config();
    let standard = config.evaluators.standard.clone();
    let high_trust = config.evaluators.high_trust.clone();
    let graph = TaskGraph::build(vec![
        test_task("CRIT").with_criticality(Criticality::Critical),
        test_task("STD"),
    ])
    .unwrap();
    let orch = orchestrator(config, &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&graph, RunId::new(), CancellationToken::new())
        .await
        .unwrap();
    assert!(summary.is_success());

    for call in scorer.calls() {
        let expected = if call.task_id == TaskId::from("CRIT") {
            &high_trust
        } else {
            &standard
        };
        assert_eq!(&call.profile, expected);
    }
    let crit = summary.get(&TaskId::from("CRIT")).unwrap();
    assert_eq!(crit.verdicts[0].evaluator, high_trust);
}

/// Test: Low-confidence accept
/// Given a 90 / 60 accept where the backend reports confidence 0.3
/// When the task is adjudicated
/// Then the accept is escalated for low confidence instead of closing
#[tokio::test]
async fn test_low_confidence_accept_escalates() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    scorer.always("T-1", Score::WithConfidence(90.0, 60.0, 0.3));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&single("T-1", Criticality::Standard), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Escalated);
    assert_eq!(result.verdicts[0].kind, VerdictKind::AcceptFirst);
    assert!((result.verdicts[0].confidence - 0.3).abs() < 1e-9);
    match &result.escalation.as_ref().unwrap().reason {
        EscalationReason::LowConfidence {
            confidence,
            threshold,
        } => {
            assert!((confidence - 0.3).abs() < 1e-9);
            assert!((threshold - 0.6).abs() < 1e-9);
        }
        other => panic!("expected low confidence, got {:?}", other),
    }
}
