//! Task data model for the execution DAG.
//!
//! Tasks are immutable specifications of atomic work. Anything that looks
//! like a change (feedback folded into constraints, dependency outputs folded
//! into the input) produces a new `Task` value instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Input key under which accepted dependency artifacts are folded.
pub const DEPENDENCY_OUTPUTS_KEY: &str = "dependency_outputs";

/// Unique identifier for a task within a graph (e.g. `T-001`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Importance tier of a task.
///
/// Governs how many strategies run, which evaluator profile scores the
/// candidates, and how long each external call may take. Variants are
/// declared in ascending order so `Ord` follows importance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Single strategy, no adjudication.
    Simple,
    /// Dual strategy, standard evaluator.
    #[default]
    Standard,
    /// Dual strategy, standard evaluator, longer timeouts.
    Important,
    /// Dual strategy, high-trust evaluator.
    Critical,
}

impl Criticality {
    /// Whether this tier runs two strategies and an evaluator.
    pub fn is_adjudicated(&self) -> bool {
        !matches!(self, Criticality::Simple)
    }
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::Simple => write!(f, "simple"),
            Criticality::Standard => write!(f, "standard"),
            Criticality::Important => write!(f, "important"),
            Criticality::Critical => write!(f, "critical"),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Natural-language description of the work.
    pub description: String,
    /// Structured input payload.
    #[serde(default)]
    pub input: BTreeMap<String, Value>,
    /// Description of the expected output.
    #[serde(default)]
    pub expected_output: String,
    /// Constraints the artifact must satisfy.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Tasks that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// How the artifact should be verified.
    #[serde(default)]
    pub verification: String,
    /// Importance tier.
    #[serde(default)]
    pub criticality: Criticality,
}

impl Task {
    /// Create a task with the given id and description.
    ///
    /// All other fields start empty and the criticality is `Standard`.
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            input: BTreeMap::new(),
            expected_output: String::new(),
            constraints: Vec::new(),
            dependencies: Vec::new(),
            verification: String::new(),
            criticality: Criticality::default(),
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, key: &str, value: Value) -> Self {
        self.input.insert(key.to_string(), value);
        self
    }

    pub fn with_expected_output(mut self, output: &str) -> Self {
        self.expected_output = output.to_string();
        self
    }

    pub fn with_verification(mut self, verification: &str) -> Self {
        self.verification = verification.to_string();
        self
    }

    /// Return a copy of this task with extra constraints appended.
    ///
    /// Used to carry evaluator feedback into the next attempt.
    pub fn with_constraints<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.constraints.extend(extra.into_iter().map(Into::into));
        next
    }

    /// Return a copy of this task with accepted dependency artifacts folded
    /// into its input under [`DEPENDENCY_OUTPUTS_KEY`].
    pub fn with_dependency_outputs(&self, outputs: &BTreeMap<TaskId, String>) -> Self {
        if outputs.is_empty() {
            return self.clone();
        }
        let folded: serde_json::Map<String, Value> = outputs
            .iter()
            .map(|(id, artifact)| (id.0.clone(), Value::String(artifact.clone())))
            .collect();
        let mut next = self.clone();
        next.input
            .insert(DEPENDENCY_OUTPUTS_KEY.to_string(), Value::Object(folded));
        next
    }

    /// Whether the task has no dependencies.
    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }
}
