//! Aggregate call statistics for a run.
//!
//! Built from the per-call telemetry recorded while the run executed, so a
//! resumed run reports totals across every session that worked on it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::outcome::Strategy;

/// Count, total, min and max of a set of durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl Timing {
    pub fn record(&mut self, elapsed_ms: u64) {
        self.count += 1;
        self.total_ms = self.total_ms.saturating_add(elapsed_ms);
        self.min_ms = Some(self.min_ms.map_or(elapsed_ms, |m| m.min(elapsed_ms)));
        self.max_ms = Some(self.max_ms.map_or(elapsed_ms, |m| m.max(elapsed_ms)));
    }

    pub fn avg_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_ms as f64 / self.count as f64)
    }
}

/// Executor usage for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub calls: u64,
    /// Calls that errored or timed out.
    pub errors: u64,
    /// Calls that produced an artifact which failed verification.
    pub failed_verification: u64,
    pub tokens_used: u64,
    pub timing: Timing,
}

/// Evaluator usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorStats {
    pub calls: u64,
    pub errors: u64,
    pub timing: Timing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub strategies: BTreeMap<Strategy, StrategyStats>,
    pub evaluator: EvaluatorStats,
    pub escalations: u64,
}

impl RunStats {
    pub fn record_executor_call(
        &mut self,
        strategy: Strategy,
        elapsed_ms: u64,
        tokens_used: Option<u64>,
        passed: bool,
        errored: bool,
    ) {
        let stats = self.strategies.entry(strategy).or_default();
        stats.calls += 1;
        if errored {
            stats.errors += 1;
        } else if !passed {
            stats.failed_verification += 1;
        }
        stats.tokens_used = stats.tokens_used.saturating_add(tokens_used.unwrap_or(0));
        stats.timing.record(elapsed_ms);
    }

    pub fn record_evaluator_call(&mut self, elapsed_ms: u64, errored: bool) {
        self.evaluator.calls += 1;
        if errored {
            self.evaluator.errors += 1;
        }
        self.evaluator.timing.record(elapsed_ms);
    }

    pub fn record_escalation(&mut self) {
        self.escalations += 1;
    }

    pub fn executor_calls(&self) -> u64 {
        self.strategies.values().map(|s| s.calls).sum()
    }

    pub fn tokens_used(&self) -> u64 {
        self.strategies.values().map(|s| s.tokens_used).sum()
    }
}
