//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted executor and scoring backends that record every call
//! - Predefined task graphs (chain, diamond, independent)
//! - Orchestrator construction with test-friendly configuration

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use duet::config::Config;
use duet::core::{Criticality, Strategy, Task, TaskGraph, TaskId, VerificationReport};
use duet::orchestration::{
    Draft, EvaluationError, Executor, ExecutorError, Orchestrator, ScoreRequest, ScoreSheet,
    ScoringBackend,
};
use duet::state::StateStore;

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this artifact, verified.
    Produce(String),
    /// Return this artifact with a failing self-check.
    Unverified(String),
    /// Return an executor error.
    Fail(String),
    /// Never return.
    Hang,
}

/// What the executor saw for one call.
#[derive(Debug, Clone)]
pub struct ExecutorCall {
    pub task: Task,
    pub strategy: Strategy,
    pub feedback: Vec<String>,
}

/// Executor that follows a per-(task, strategy) script.
///
/// Unscripted calls produce `"<task>/<strategy>"`.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<(TaskId, Strategy), VecDeque<Step>>>,
    fallback: Mutex<HashMap<(TaskId, Strategy), Step>>,
    calls: Mutex<Vec<ExecutorCall>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Queue steps for one task and strategy, consumed in order.
    pub fn script(&self, task: &str, strategy: Strategy, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert((TaskId::from(task), strategy), steps.into());
    }

    /// Step used for a task and strategy once its script runs out.
    pub fn always(&self, task: &str, strategy: Strategy, step: Step) {
        self.fallback
            .lock()
            .unwrap()
            .insert((TaskId::from(task), strategy), step);
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<ExecutorCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.task.id.as_str() == task)
            .collect()
    }

    /// Task ids in the order their first executor call arrived.
    pub fn start_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        for call in self.calls() {
            let id = call.task.id.0.clone();
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, task: &Task, strategy: Strategy) -> Step {
        let key = (task.id.clone(), strategy);
        if let Some(step) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|steps| steps.pop_front())
        {
            return step;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Step::Produce(format!("{}/{}", task.id, strategy)))
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn attempt(
        &self,
        task: &Task,
        strategy: Strategy,
        feedback: &[String],
    ) -> Result<Draft, ExecutorError> {
        self.calls.lock().unwrap().push(ExecutorCall {
            task: task.clone(),
            strategy,
            feedback: feedback.to_vec(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.next_step(task, strategy) {
            Step::Produce(artifact) => Ok(Draft::new(artifact)),
            Step::Unverified(artifact) => {
                Ok(Draft::new(artifact).with_self_check(VerificationReport::fail("self-check failed")))
            }
            Step::Fail(message) => Err(ExecutorError::Failed(message)),
            Step::Hang => std::future::pending().await,
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One scripted scorer response.
#[derive(Debug, Clone)]
pub enum Score {
    /// Uniform per-criterion scores for (first, second).
    Pair(f64, f64),
    /// Scores plus a backend-reported confidence.
    WithConfidence(f64, f64, f64),
    Error(EvaluationError),
}

/// What the scorer saw for one call.
#[derive(Debug, Clone)]
pub struct ScorerCall {
    pub task_id: TaskId,
    pub profile: String,
}

/// Scoring backend that follows a per-task script.
///
/// Unscripted calls score 90 / 60.
pub struct ScriptedScorer {
    scripts: Mutex<HashMap<TaskId, VecDeque<Score>>>,
    fallback: Mutex<HashMap<TaskId, Score>>,
    default: Score,
    calls: Mutex<Vec<ScorerCall>>,
}

impl Default for ScriptedScorer {
    fn default() -> Self {
        Self {
            scripts: Mutex::default(),
            fallback: Mutex::default(),
            default: Score::Pair(90.0, 60.0),
            calls: Mutex::default(),
        }
    }
}

/// Feedback every scripted sheet carries.
pub const SCORER_FEEDBACK: &str = "handle the empty input case";

impl ScriptedScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, task: &str, scores: Vec<Score>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(task), scores.into());
    }

    pub fn always(&self, task: &str, score: Score) {
        self.fallback.lock().unwrap().insert(TaskId::from(task), score);
    }

    pub fn calls(&self) -> Vec<ScorerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_score(&self, task_id: &TaskId) -> Score {
        if let Some(score) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(|s| s.pop_front())
        {
            return score;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ScoringBackend for ScriptedScorer {
    async fn score(&self, request: &ScoreRequest<'_>) -> Result<ScoreSheet, EvaluationError> {
        self.calls.lock().unwrap().push(ScorerCall {
            task_id: request.task.id.clone(),
            profile: request.profile.to_string(),
        });
        let (first, second, confidence) = match self.next_score(&request.task.id) {
            Score::Pair(a, b) => (a, b, None),
            Score::WithConfidence(a, b, c) => (a, b, Some(c)),
            Score::Error(err) => return Err(err),
        };
        Ok(ScoreSheet {
            rationale: format!("scored {} against {}", first, second),
            feedback: vec![SCORER_FEEDBACK.to_string()],
            confidence,
            ..ScoreSheet::uniform(request.criteria.keys(), first, second)
        })
    }
}

/// Default configuration with short timeouts.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.timeouts.simple = 5;
    config.timeouts.standard = 5;
    config.timeouts.important = 5;
    config.timeouts.critical = 5;
    config
}

/// Orchestrator over scripted capabilities.
pub fn orchestrator(
    config: Config,
    executor: &Arc<ScriptedExecutor>,
    scorer: &Arc<ScriptedScorer>,
    store: Arc<dyn StateStore>,
) -> Orchestrator {
    Orchestrator::new(config, executor.clone(), scorer.clone(), store)
        .expect("test config should be valid")
}

/// Create a task with the given ID.
pub fn test_task(id: &str) -> Task {
    Task::new(id, &format!("Test task {}", id))
}

/// Create a simple (single-strategy) task.
pub fn simple_task(id: &str) -> Task {
    test_task(id).with_criticality(Criticality::Simple)
}

/// Chain T-1 -> T-2 -> ... -> T-n of simple tasks.
pub fn simple_chain(n: usize) -> TaskGraph {
    let tasks = (1..=n)
        .map(|i| {
            let task = simple_task(&format!("T-{}", i));
            if i == 1 {
                task
            } else {
                task.with_dependencies([format!("T-{}", i - 1)])
            }
        })
        .collect();
    TaskGraph::build(tasks).expect("chain is acyclic")
}

/// Diamond: A -> (B, C) -> D.
pub fn diamond(criticality: Criticality) -> TaskGraph {
    TaskGraph::build(vec![
        test_task("A").with_criticality(criticality),
        test_task("B").with_criticality(criticality).with_dependencies(["A"]),
        test_task("C").with_criticality(criticality).with_dependencies(["A"]),
        test_task("D")
            .with_criticality(criticality)
            .with_dependencies(["B", "C"]),
    ])
    .expect("diamond is acyclic")
}

/// `n` independent simple tasks.
pub fn independent_simple(n: usize) -> TaskGraph {
    TaskGraph::build((1..=n).map(|i| simple_task(&format!("T-{}", i))).collect())
        .expect("independent tasks are acyclic")
}
