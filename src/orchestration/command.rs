//! External-process bindings for the executor and scoring capabilities.
//!
//! Both bindings spawn the configured command, write one JSON request to its
//! stdin and read the reply from stdout. Callers apply the per-tier deadline;
//! the child is killed if the call is dropped.
//!
//! Executor reply: either a JSON object
//! `{"artifact": "...", "self_check": {"passed": true, "diagnostics": []}, "tokens_used": 120}`
//! or plain text, taken as the artifact verbatim.
//!
//! Scorer reply: a JSON [`ScoreSheet`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandBinding;
use crate::core::outcome::{Candidate, Strategy, VerificationReport};
use crate::core::task::Task;
use crate::orchestration::executor::{Draft, Executor, ExecutorError};
use crate::orchestration::judge::{EvaluationError, ScoreRequest, ScoreSheet, ScoringBackend};
use crate::{Error, Result};

/// Output of a finished child process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Error text for a failed run: stderr if any, else the exit code.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!(
                "command failed with exit code {}",
                self.code.unwrap_or(-1)
            )
        } else {
            stderr.to_string()
        }
    }
}

/// A resolved command plus its fixed arguments.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
    args: Vec<String>,
}

impl ProcessRunner {
    /// Resolve `binding.command` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandNotFound`] if the command cannot be found.
    pub fn new(binding: &CommandBinding) -> Result<Self> {
        let binary = which::which(&binding.command)
            .map_err(|_| Error::CommandNotFound(binding.command.clone()))?;
        Ok(Self::with_binary(binary, binding.args.clone()))
    }

    /// Use a specific binary path without a `PATH` lookup.
    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the command with `input` on stdin and collect its output.
    pub async fn run(&self, input: &[u8]) -> std::io::Result<ProcessOutput> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while collecting output so a chatty child cannot block.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        match fed {
            // The child exited without reading its input.
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
            other => other?,
        }
        let output = output?;
        // Stdout carries artifacts and must arrive intact; stderr is only
        // ever shown as diagnostics.
        let stdout = String::from_utf8(output.stdout).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "command output is not valid UTF-8 (invalid byte at offset {})",
                    err.utf8_error().valid_up_to()
                ),
            )
        })?;
        Ok(ProcessOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Serialize)]
struct AttemptRequest<'a> {
    task: &'a Task,
    strategy: Strategy,
    feedback: &'a [String],
}

#[derive(Deserialize)]
struct AttemptReply {
    artifact: String,
    #[serde(default)]
    self_check: Option<VerificationReport>,
    #[serde(default)]
    tokens_used: Option<u64>,
}

/// Executor backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    runner: ProcessRunner,
}

impl CommandExecutor {
    pub fn new(binding: &CommandBinding) -> Result<Self> {
        Ok(Self {
            runner: ProcessRunner::new(binding)?,
        })
    }

    pub fn from_runner(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    /// Interpret the command's stdout as a draft.
    pub fn parse_reply(stdout: &str) -> Draft {
        match serde_json::from_str::<AttemptReply>(stdout.trim()) {
            Ok(reply) => Draft {
                artifact: reply.artifact,
                self_check: reply.self_check,
                tokens_used: reply.tokens_used,
            },
            Err(_) => Draft::new(stdout),
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn attempt(
        &self,
        task: &Task,
        strategy: Strategy,
        feedback: &[String],
    ) -> std::result::Result<Draft, ExecutorError> {
        let request = serde_json::to_vec(&AttemptRequest {
            task,
            strategy,
            feedback,
        })
        .map_err(|e| ExecutorError::Failed(e.to_string()))?;

        debug!(task = %task.id, %strategy, binary = %self.runner.binary().display(), "spawning executor");
        let output = self.runner.run(&request).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => ExecutorError::Failed(e.to_string()),
            _ => ExecutorError::Unavailable(e.to_string()),
        })?;
        if !output.success {
            return Err(ExecutorError::Failed(output.failure_message()));
        }
        Ok(Self::parse_reply(&output.stdout))
    }
}

#[derive(Serialize)]
struct CandidateView<'a> {
    strategy: Strategy,
    artifact: &'a str,
    verification: &'a VerificationReport,
}

impl<'a> From<&'a Candidate> for CandidateView<'a> {
    fn from(c: &'a Candidate) -> Self {
        Self {
            strategy: c.strategy,
            artifact: &c.artifact,
            verification: &c.verification,
        }
    }
}

#[derive(Serialize)]
struct ScoreRequestBody<'a> {
    profile: &'a str,
    task: &'a Task,
    first: CandidateView<'a>,
    second: CandidateView<'a>,
    criteria: &'a std::collections::BTreeMap<String, f64>,
}

/// Scoring backend backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    runner: ProcessRunner,
}

impl CommandScorer {
    pub fn new(binding: &CommandBinding) -> Result<Self> {
        Ok(Self {
            runner: ProcessRunner::new(binding)?,
        })
    }

    pub fn from_runner(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ScoringBackend for CommandScorer {
    async fn score(&self, request: &ScoreRequest<'_>) -> std::result::Result<ScoreSheet, EvaluationError> {
        let body = serde_json::to_vec(&ScoreRequestBody {
            profile: request.profile,
            task: request.task,
            first: request.first.into(),
            second: request.second.into(),
            criteria: request.criteria,
        })
        .map_err(|e| EvaluationError::Malformed(e.to_string()))?;

        let output = self.runner.run(&body).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => EvaluationError::Malformed(e.to_string()),
            _ => EvaluationError::Unavailable(e.to_string()),
        })?;
        if !output.success {
            return Err(EvaluationError::Unavailable(output.failure_message()));
        }
        serde_json::from_str(output.stdout.trim())
            .map_err(|e| EvaluationError::Malformed(e.to_string()))
    }
}
