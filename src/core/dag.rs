//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `TaskGraph` is an arena of tasks indexed by id with edges derived from
//! each task's dependency list. It is validated once at construction and is
//! read-only afterwards. Completion bookkeeping during a run lives in
//! [`Schedule`], which is owned by a single writer (the orchestrator loop).

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Reasons a set of tasks cannot form a valid graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("circular dependency: {}", format_cycle(.path))]
    Cycle {
        /// Task ids along the cycle; the first id is repeated at the end.
        path: Vec<TaskId>,
    },
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum GraphDocument {
    Tasks(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

/// DFS colouring used by cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// The task dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a graph from a list of tasks.
    ///
    /// # Errors
    /// - [`GraphError::DuplicateTask`] if two tasks share an id
    /// - [`GraphError::UnknownDependency`] if a dependency id is not in the set
    /// - [`GraphError::Cycle`] if the dependency relation is cyclic
    pub fn build(tasks: Vec<Task>) -> std::result::Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(GraphError::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dep in &task.dependencies {
                let dep_index = task_index.get(dep).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            // update_edge keeps repeated dependency ids from producing parallel edges
            graph.update_edge(from, to, ());
        }

        let dag = Self { graph, task_index };
        if let Some(path) = dag.find_cycle() {
            return Err(GraphError::Cycle { path });
        }
        Ok(dag)
    }

    /// Depth-first search with an on-stack marker.
    ///
    /// Returns the first cycle found as a path of task ids whose last element
    /// repeats the first.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|index| self.graph[index].id.clone())
                        .collect(),
                );
            }
        }
        None
    }

    /// Iterative DFS from `start`. Each frame holds a node and the
    /// successors it has yet to explore, so depth is bounded by the heap.
    fn visit(&self, start: NodeIndex, marks: &mut [Mark]) -> Option<Vec<NodeIndex>> {
        marks[start.index()] = Mark::OnStack;
        let mut frames = vec![(start, self.successors(start))];

        while let Some((node, pending)) = frames.last_mut() {
            let node = *node;
            let Some(next) = pending.pop() else {
                marks[node.index()] = Mark::Done;
                frames.pop();
                continue;
            };
            match marks[next.index()] {
                Mark::OnStack => {
                    let start = frames.iter().position(|(n, _)| *n == next)?;
                    let mut cycle: Vec<NodeIndex> = frames[start..].iter().map(|(n, _)| *n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next.index()] = Mark::OnStack;
                    frames.push((next, self.successors(next)));
                }
                Mark::Done => {}
            }
        }
        None
    }

    /// Dependents of `node`, reversed so popping visits them in graph order.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.reverse();
        next
    }

    /// Get a task by id.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Check if the graph contains a task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All tasks in the order they were supplied.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Lazily produce ready batches in dependency order.
    ///
    /// Each batch is the maximal set of not-yet-yielded tasks whose
    /// dependencies all appeared in strictly earlier batches. The iterator is
    /// finite; calling this again starts over.
    pub fn topological_batches(&self) -> Batches<'_> {
        Batches {
            graph: self,
            emitted: HashSet::with_capacity(self.len()),
        }
    }

    /// Map each dependency of `task_id` to its accepted artifact.
    ///
    /// # Errors
    /// - [`Error::TaskNotFound`] if `task_id` is not in the graph
    /// - [`Error::DependencyNotReady`] if any dependency has no completed
    ///   artifact in `artifacts`. This indicates a scheduling bug.
    pub fn dependency_outputs(
        &self,
        task_id: &TaskId,
        artifacts: &HashMap<TaskId, String>,
    ) -> Result<BTreeMap<TaskId, String>> {
        let task = self
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

        task.dependencies
            .iter()
            .map(|dep| match artifacts.get(dep) {
                Some(artifact) => Ok((dep.clone(), artifact.clone())),
                None => Err(Error::DependencyNotReady {
                    task: task_id.clone(),
                    dependency: dep.clone(),
                }),
            })
            .collect()
    }

    /// Parse and validate a graph document.
    ///
    /// The document is either a JSON array of tasks or an object with a
    /// `tasks` array.
    pub fn from_json(json: &str) -> Result<Self> {
        let tasks = match serde_json::from_str(json)? {
            GraphDocument::Tasks(tasks) | GraphDocument::Wrapped { tasks } => tasks,
        };
        Ok(Self::build(tasks)?)
    }

    /// Read a graph document from disk.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Start completion bookkeeping for a run over this graph.
    pub fn schedule(&self) -> Schedule<'_> {
        Schedule {
            graph: self,
            artifacts: HashMap::new(),
            settled: HashSet::new(),
            running: HashSet::new(),
        }
    }

    fn deps_satisfied(&self, index: NodeIndex, done: impl Fn(&TaskId) -> bool) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| done(&self.graph[dep].id))
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}

/// Iterator over the ready batches of a [`TaskGraph`].
#[derive(Debug)]
pub struct Batches<'a> {
    graph: &'a TaskGraph,
    emitted: HashSet<TaskId>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Vec<&'a Task>;

    fn next(&mut self) -> Option<Self::Item> {
        let graph = self.graph;
        let batch: Vec<&'a Task> = graph
            .graph
            .node_indices()
            .filter(|&index| !self.emitted.contains(&graph.graph[index].id))
            .filter(|&index| graph.deps_satisfied(index, |id| self.emitted.contains(id)))
            .map(|index| &graph.graph[index])
            .collect();

        if batch.is_empty() {
            return None;
        }
        self.emitted.extend(batch.iter().map(|t| t.id.clone()));
        Some(batch)
    }
}

/// Completion bookkeeping for one run.
///
/// Tracks which tasks are running, completed (with their accepted artifact)
/// or settled without completing. It is the only state mutated as task
/// branches finish, so it must only be touched by the run loop.
#[derive(Debug)]
pub struct Schedule<'a> {
    graph: &'a TaskGraph,
    artifacts: HashMap<TaskId, String>,
    settled: HashSet<TaskId>,
    running: HashSet<TaskId>,
}

impl<'a> Schedule<'a> {
    /// Record that a task branch has been launched.
    pub fn mark_running(&mut self, id: &TaskId) {
        self.running.insert(id.clone());
    }

    /// Record a completed task and its accepted artifact.
    ///
    /// A previously settled task (for example a resolved escalation) moves
    /// to completed, which can unblock its dependents.
    pub fn mark_completed(&mut self, id: &TaskId, artifact: String) {
        self.running.remove(id);
        self.settled.remove(id);
        self.artifacts.insert(id.clone(), artifact);
    }

    /// Record a task that reached a terminal status other than completed.
    pub fn mark_settled(&mut self, id: &TaskId) {
        self.running.remove(id);
        self.settled.insert(id.clone());
    }

    /// Forget that a task was launched without recording an outcome.
    pub fn clear_running(&mut self, id: &TaskId) {
        self.running.remove(id);
    }

    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.artifacts.contains_key(id)
    }

    pub fn is_finished(&self, id: &TaskId) -> bool {
        self.artifacts.contains_key(id) || self.settled.contains(id)
    }

    pub fn is_running(&self, id: &TaskId) -> bool {
        self.running.contains(id)
    }

    /// Accepted artifact of a completed task.
    pub fn artifact(&self, id: &TaskId) -> Option<&str> {
        self.artifacts.get(id).map(String::as_str)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn completed_count(&self) -> usize {
        self.artifacts.len()
    }

    /// The current ready set: unfinished, not running, every dependency
    /// completed.
    pub fn ready_batch(&self) -> Vec<&'a Task> {
        let graph = self.graph;
        graph
            .graph
            .node_indices()
            .filter(|&index| {
                let id = &graph.graph[index].id;
                !self.is_finished(id) && !self.running.contains(id)
            })
            .filter(|&index| graph.deps_satisfied(index, |id| self.artifacts.contains_key(id)))
            .map(|index| &graph.graph[index])
            .collect()
    }

    /// Unfinished tasks that are neither running nor ready.
    pub fn pending(&self) -> Vec<&'a Task> {
        let ready: HashSet<TaskId> = self.ready_batch().into_iter().map(|t| t.id.clone()).collect();
        self.graph
            .tasks()
            .filter(|t| !self.is_finished(&t.id) && !self.running.contains(&t.id))
            .filter(|t| !ready.contains(&t.id))
            .collect()
    }

    /// First dependency of `id` that has not completed, if any.
    pub fn blocking_dependency(&self, id: &TaskId) -> Option<&'a TaskId> {
        self.graph
            .get(id)?
            .dependencies
            .iter()
            .find(|dep| !self.artifacts.contains_key(*dep))
    }

    /// Whether every task has finished.
    pub fn all_finished(&self) -> bool {
        self.graph.tasks().all(|t| self.is_finished(&t.id))
    }

    /// See [`TaskGraph::dependency_outputs`].
    pub fn dependency_outputs(&self, id: &TaskId) -> Result<BTreeMap<TaskId, String>> {
        self.graph.dependency_outputs(id, &self.artifacts)
    }
}
