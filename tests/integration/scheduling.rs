//! Dependency ordering and parallelism tests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use duet::core::task::DEPENDENCY_OUTPUTS_KEY;
use duet::core::{Criticality, ExecutionStatus, GraphError, RunId, Strategy, TaskGraph, TaskId};
use duet::MemoryStateStore;

use crate::fixtures::{
    diamond, independent_simple, orchestrator, simple_task, test_config, test_task,
    ScriptedExecutor, ScriptedScorer, Step,
};

/// Test: Diamond ordering
/// Given A -> (B, C) -> D
/// When the graph runs
/// Then A starts first, D starts last, and every task completes
#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let graph = diamond(Criticality::Standard);
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&graph, RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.count(ExecutionStatus::Completed), 4);

    let order = executor.start_order();
    assert_eq!(order.first().map(String::as_str), Some("A"));
    assert_eq!(order.last().map(String::as_str), Some("D"));
}

/// Test: Dependency outputs flow into dependents
/// Given B depends on A
/// When B runs
/// Then its input carries A's accepted artifact
#[tokio::test]
async fn test_dependency_outputs_folded_into_input() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("A", Strategy::Pragmatic, Step::Produce("fn parse() {}".into()));
    let graph = TaskGraph::build(vec![
        test_task("A"),
        test_task("B").with_dependencies(["A"]),
    ])
    .unwrap();
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&graph, RunId::new(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        summary.get(&TaskId::from("A")).unwrap().artifact.as_deref(),
        Some("fn parse() {}")
    );

    let b_calls = executor.calls_for("B");
    assert_eq!(b_calls.len(), 2);
    for call in b_calls {
        assert_eq!(
            call.task.input[DEPENDENCY_OUTPUTS_KEY]["A"],
            serde_json::json!("fn parse() {}")
        );
    }
}

/// Test: Concurrency bound
/// Given 6 independent simple tasks and max_parallel = 2
/// When the graph runs
/// Then no more than 2 executor calls are ever in flight
#[tokio::test]
async fn test_max_parallel_respected() {
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(20)));
    let scorer = Arc::new(ScriptedScorer::new());
    let mut config = test_config();
    config.max_parallel = 2;
    let orch = orchestrator(config, &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&independent_simple(6), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.count(ExecutionStatus::Completed), 6);
    assert!(
        executor.peak_in_flight() <= 2,
        "peak in-flight calls was {}",
        executor.peak_in_flight()
    );
}

/// Test: Independent tasks run concurrently
/// Given 4 independent simple tasks and max_parallel = 4
/// When every call takes 50ms
/// Then more than one call is in flight at some point
#[tokio::test]
async fn test_independent_tasks_overlap() {
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(50)));
    let scorer = Arc::new(ScriptedScorer::new());
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    orch.run(&independent_simple(4), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert!(executor.peak_in_flight() > 1);
}

/// Test: Cycle detection
/// Given A -> B -> A
/// When the graph is built
/// Then a cycle error names both tasks and nothing can run
#[test]
fn test_cycle_is_rejected_before_execution() {
    let err = TaskGraph::build(vec![
        test_task("A").with_dependencies(["B"]),
        test_task("B").with_dependencies(["A"]),
    ])
    .unwrap_err();

    match err {
        GraphError::Cycle { path } => {
            assert!(path.contains(&TaskId::from("A")));
            assert!(path.contains(&TaskId::from("B")));
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

/// Test: Simple tasks skip adjudication
/// Given only simple tasks
/// When the graph runs
/// Then only the primary strategy is used and the scorer is never called
#[tokio::test]
async fn test_simple_tasks_use_single_strategy() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&independent_simple(3), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.count(ExecutionStatus::Completed), 3);
    assert_eq!(scorer.call_count(), 0);
    let calls = executor.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.strategy == Strategy::Pragmatic));
    for result in &summary.results {
        assert_eq!(result.attempts, 1);
        assert!(result.verdicts.is_empty());
    }
}

/// Test: Failure isolation
/// Given A fails, B depends on A, and C is independent
/// When the graph runs
/// Then A is failed, B is skipped naming A, and C completes
#[tokio::test]
async fn test_failed_dependency_skips_dependents_only() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("A", Strategy::Pragmatic, Step::Fail("compiler crashed".into()));
    let graph = TaskGraph::build(vec![
        simple_task("A"),
        simple_task("B").with_dependencies(["A"]),
        simple_task("C"),
    ])
    .unwrap();
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&graph, RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.results.len(), 3);
    let a = summary.get(&TaskId::from("A")).unwrap();
    assert_eq!(a.status, ExecutionStatus::Failed);
    assert!(a.detail.as_deref().unwrap().contains("compiler crashed"));

    let b = summary.get(&TaskId::from("B")).unwrap();
    assert_eq!(b.status, ExecutionStatus::Skipped);
    assert_eq!(b.detail.as_deref(), Some("dependency A did not complete"));

    assert_eq!(
        summary.get(&TaskId::from("C")).unwrap().status,
        ExecutionStatus::Completed
    );
    assert!(executor.calls_for("B").is_empty());
}

/// Test: Unverified simple task
/// Given a simple task whose self-check fails
/// When it runs
/// Then it fails with the verification diagnostics
#[tokio::test]
async fn test_simple_task_failing_verification() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("T-1", Strategy::Pragmatic, Step::Unverified("draft".into()));
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&independent_simple(1), RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let result = &summary.results[0];
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.artifact.is_none());
    assert!(result.detail.as_deref().unwrap().contains("self-check failed"));
}

/// Test: Summary order
/// Given tasks declared in a fixed order
/// When the graph runs
/// Then the summary lists every task once, in declaration order
#[tokio::test]
async fn test_summary_lists_every_task_once() {
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let graph = diamond(Criticality::Simple);
    let orch = orchestrator(test_config(), &executor, &scorer, Arc::new(MemoryStateStore::new()));

    let summary = orch
        .run(&graph, RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = summary.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C", "D"]);
    assert!(!summary.cancelled);
    assert!(!summary.deadline_elapsed);
}
