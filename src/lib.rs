//! duet: redundant-execution task orchestrator.
//!
//! A dependency graph of tasks is executed in ready batches. Every
//! non-trivial task is attempted by two executor strategies in parallel,
//! the candidates are scored by an evaluator, rejected attempts are retried
//! with the evaluator's feedback, and tasks automated judgement cannot
//! settle are escalated to an external decision-maker.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use config::Config;
pub use crate::core::{Criticality, ExecutionResult, ExecutionStatus, RunId, RunSummary, Task, TaskGraph, TaskId};
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, ProgressEvent};
pub use state::{JsonStateStore, MemoryStateStore, StateStore};
