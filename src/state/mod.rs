//! Durable run state.
//!
//! Execution results, traces and run summaries are written through the
//! [`StateStore`] trait so a cancelled or crashed run can be resumed.

mod store;

pub use store::{aggregate, JsonStateStore, MemoryStateStore, StateStore, TraceEvent, TraceKind};
