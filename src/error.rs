use crate::core::dag::GraphError;
use crate::core::task::TaskId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid task graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dependency {dependency} of task {task} has not completed")]
    DependencyNotReady { task: TaskId, dependency: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("State store error: {0}")]
    Store(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
