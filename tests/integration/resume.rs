//! Cancellation, deadline and resume tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use duet::core::{ExecutionStatus, RunId, Strategy, TaskId};
use duet::orchestration::ProgressEvent;
use duet::state::StateStore;
use duet::{JsonStateStore, MemoryStateStore};

use crate::fixtures::{
    diamond, orchestrator, simple_chain, test_config, ScriptedExecutor, ScriptedScorer, Step,
};

/// Test: Store round trip
/// Given a run over the JSON file store
/// When the run finishes
/// Then every result and the summary can be read back from disk
#[tokio::test]
async fn test_json_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()).await.unwrap());
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let graph = diamond(duet::Criticality::Standard);
    let run_id = RunId::new();
    let orch = orchestrator(test_config(), &executor, &scorer, store.clone());

    let summary = orch
        .run(&graph, run_id, CancellationToken::new())
        .await
        .unwrap();

    let reopened = JsonStateStore::new(dir.path()).await.unwrap();
    let loaded = reopened.load_run(&run_id).await.unwrap();
    assert_eq!(loaded.len(), 4);
    for result in &loaded {
        let original = summary.get(&result.task_id).unwrap();
        assert_eq!(result.status, original.status);
        assert_eq!(result.artifact, original.artifact);
        assert_eq!(result.verdicts.len(), original.verdicts.len());
    }
    let stored = reopened.load_summary(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.run_id, run_id);
    assert_eq!(stored.results.len(), 4);
    assert!(stored.is_success());
    assert_eq!(reopened.list_runs().await.unwrap(), vec![run_id]);
}

/// Test: Cancel and resume
/// Given a chain of 5 tasks
/// When the run is cancelled after 2 tasks complete
/// Then exactly those 2 are persisted, and resuming runs only the other 3
#[tokio::test]
async fn test_cancel_after_two_then_resume() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()).await.unwrap());
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let graph = simple_chain(5);
    let run_id = RunId::new();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let orch = orchestrator(test_config(), &executor, &scorer, store.clone()).on_progress(
        move |event| {
            if matches!(event, ProgressEvent::TaskCompleted { .. })
                && counter.fetch_add(1, Ordering::SeqCst) + 1 == 2
            {
                trigger.cancel();
            }
        },
    );

    let summary = orch.run(&graph, run_id, cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.count(ExecutionStatus::Completed), 2);
    assert_eq!(summary.count(ExecutionStatus::Skipped), 3);
    for id in ["T-3", "T-4", "T-5"] {
        assert_eq!(
            summary.get(&TaskId::from(id)).unwrap().detail.as_deref(),
            Some("run cancelled")
        );
    }

    let persisted = store.load_run(&run_id).await.unwrap();
    let ids: Vec<&str> = persisted.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["T-1", "T-2"]);
    assert_eq!(executor.calls().len(), 2);

    let resumed = orchestrator(test_config(), &executor, &scorer, store.clone());
    let summary = resumed
        .run(&graph, run_id, CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert!(!summary.cancelled);
    assert_eq!(executor.start_order(), vec!["T-1", "T-2", "T-3", "T-4", "T-5"]);
    assert_eq!(executor.calls().len(), 5);
    assert_eq!(store.load_run(&run_id).await.unwrap().len(), 5);
}

/// Test: Cancellation aborts in-flight work
/// Given a task whose executor never answers
/// When the run is cancelled
/// Then nothing is persisted and the task is reported as skipped
#[tokio::test(start_paused = true)]
async fn test_cancel_aborts_in_flight_branch() {
    let store = Arc::new(MemoryStateStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("T-1", Strategy::Pragmatic, Step::Hang);
    let graph = simple_chain(1);
    let run_id = RunId::new();
    let mut config = test_config();
    config.timeouts.simple = 3600;
    let orch = orchestrator(config, &executor, &scorer, store.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let summary = orch.run(&graph, run_id, cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.results[0].status, ExecutionStatus::Skipped);
    assert!(store.raw_results(&run_id).await.is_empty());
    assert_eq!(store.load_summary(&run_id).await.unwrap(), Some(summary));
}

/// Test: Global deadline
/// Given one hanging task, one quick task and a 10 second run deadline
/// When the deadline passes
/// Then the quick task is kept and the hanging one is reported as skipped
#[tokio::test(start_paused = true)]
async fn test_run_deadline_stops_the_run() {
    let store = Arc::new(MemoryStateStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.always("T-1", Strategy::Pragmatic, Step::Hang);
    let mut config = test_config();
    config.timeouts.simple = 3600;
    config.run_deadline_secs = Some(10);
    let graph = crate::fixtures::independent_simple(2);
    let orch = orchestrator(config, &executor, &scorer, store.clone());

    let summary = orch
        .run(&graph, RunId::new(), CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.deadline_elapsed);
    assert!(!summary.cancelled);
    let hung = summary.get(&TaskId::from("T-1")).unwrap();
    assert_eq!(hung.status, ExecutionStatus::Skipped);
    assert_eq!(hung.detail.as_deref(), Some("run deadline elapsed"));
    assert_eq!(
        summary.get(&TaskId::from("T-2")).unwrap().status,
        ExecutionStatus::Completed
    );
}

/// Test: Completed runs are not repeated
/// Given a finished run
/// When it is run again with the same run id
/// Then no executor is called
#[tokio::test]
async fn test_rerun_of_finished_run_is_a_no_op() {
    let store = Arc::new(MemoryStateStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    let graph = diamond(duet::Criticality::Standard);
    let run_id = RunId::new();
    let orch = orchestrator(test_config(), &executor, &scorer, store.clone());

    let first = orch.run(&graph, run_id, CancellationToken::new()).await.unwrap();
    let calls = executor.calls().len();
    let second = orch.run(&graph, run_id, CancellationToken::new()).await.unwrap();

    assert_eq!(executor.calls().len(), calls);
    assert_eq!(scorer.call_count(), 4);
    for (a, b) in first.results.iter().zip(&second.results) {
        assert_eq!(a.status, b.status);
        assert_eq!(a.artifact, b.artifact);
    }
}

/// Test: Run statistics
/// Given a diamond where one comprehensive attempt errors
/// When the run finishes over the JSON store
/// Then the summary counts executor and evaluator calls per strategy, and
/// the stored summary carries the same statistics
#[tokio::test]
async fn test_summary_aggregates_call_statistics() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()).await.unwrap());
    let executor = Arc::new(ScriptedExecutor::new());
    let scorer = Arc::new(ScriptedScorer::new());
    executor.script("B", Strategy::Comprehensive, vec![Step::Fail("rate limited".into())]);
    let graph = diamond(duet::Criticality::Standard);
    let run_id = RunId::new();
    let orch = orchestrator(test_config(), &executor, &scorer, store.clone());

    let summary = orch.run(&graph, run_id, CancellationToken::new()).await.unwrap();

    assert!(summary.is_success());
    let stats = &summary.stats;
    assert_eq!(stats.executor_calls(), 8);
    let pragmatic = &stats.strategies[&Strategy::Pragmatic];
    assert_eq!(pragmatic.calls, 4);
    assert_eq!(pragmatic.errors, 0);
    assert_eq!(pragmatic.timing.count, 4);
    let comprehensive = &stats.strategies[&Strategy::Comprehensive];
    assert_eq!(comprehensive.calls, 4);
    assert_eq!(comprehensive.errors, 1);
    assert_eq!(stats.evaluator.calls, 4);
    assert_eq!(stats.evaluator.errors, 0);
    assert_eq!(stats.escalations, 0);

    let stored = store.load_summary(&run_id).await.unwrap().unwrap();
    assert_eq!(&stored.stats, stats);
}
