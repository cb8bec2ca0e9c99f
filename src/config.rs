use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::outcome::Strategy;
use crate::core::task::Criticality;
use crate::{Error, Result};

/// Tolerance for the weight-sum check.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Run configuration, loaded from `~/.duet/duet.toml` by default.
///
/// Every field has a default, so an empty file (or no file at all) is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retries allowed after the first rejected attempt.
    pub max_retries: u32,
    /// Maximum number of task branches running at once.
    pub max_parallel: usize,
    /// Minimum weighted score (0-100) for a candidate to be accepted.
    pub rejection_score_floor: f64,
    /// Lead (0-100 scale) required for one candidate to win outright.
    pub accept_margin: f64,
    /// Accept verdicts below this confidence are escalated.
    pub confidence_escalation_threshold: f64,
    /// Global wall-clock limit for a run.
    pub run_deadline_secs: Option<u64>,
    /// How often pending escalations are re-polled during a run.
    pub escalation_poll_interval_secs: Option<u64>,
    /// Where run records are written. Defaults to `~/.duet/runs`.
    pub state_dir: Option<String>,
    /// Criterion name to weight; must sum to 1.0.
    pub weights: BTreeMap<String, f64>,
    pub timeouts: TierTimeouts,
    pub strategies: StrategyPair,
    pub evaluators: EvaluatorProfiles,
    /// External command used as the executor by the CLI.
    pub executor: Option<CommandBinding>,
    /// External command used as the scoring backend by the CLI.
    pub scorer: Option<CommandBinding>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_parallel: 4,
            rejection_score_floor: 70.0,
            accept_margin: 5.0,
            confidence_escalation_threshold: 0.6,
            weights: default_weights(),
            timeouts: TierTimeouts::default(),
            strategies: StrategyPair::default(),
            evaluators: EvaluatorProfiles::default(),
            run_deadline_secs: None,
            escalation_poll_interval_secs: None,
            state_dir: None,
            executor: None,
            scorer: None,
        }
    }
}

/// Default criterion weights.
pub fn default_weights() -> BTreeMap<String, f64> {
    [
        ("correctness", 0.30),
        ("edge_cases", 0.20),
        ("security", 0.20),
        ("quality", 0.15),
        ("efficiency", 0.10),
        ("completeness", 0.05),
    ]
    .into_iter()
    .map(|(name, weight)| (name.to_string(), weight))
    .collect()
}

/// Per-call timeout in seconds for each criticality tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTimeouts {
    pub simple: u64,
    pub standard: u64,
    pub important: u64,
    pub critical: u64,
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self {
            simple: 60,
            standard: 120,
            important: 180,
            critical: 300,
        }
    }
}

impl TierTimeouts {
    pub fn for_tier(&self, criticality: Criticality) -> Duration {
        let secs = match criticality {
            Criticality::Simple => self.simple,
            Criticality::Standard => self.standard,
            Criticality::Important => self.important,
            Criticality::Critical => self.critical,
        };
        Duration::from_secs(secs)
    }
}

/// The two executor strategies of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyPair {
    /// Runs for every task, including simple ones.
    pub primary: Strategy,
    pub secondary: Strategy,
}

impl Default for StrategyPair {
    fn default() -> Self {
        Self {
            primary: Strategy::Pragmatic,
            secondary: Strategy::Comprehensive,
        }
    }
}

/// Evaluator profile names passed to the scoring backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorProfiles {
    pub standard: String,
    /// Used for critical tasks.
    pub high_trust: String,
}

impl Default for EvaluatorProfiles {
    fn default() -> Self {
        Self {
            standard: "standard".to_string(),
            high_trust: "high_trust".to_string(),
        }
    }
}

impl EvaluatorProfiles {
    pub fn for_tier(&self, criticality: Criticality) -> &str {
        match criticality {
            Criticality::Critical => &self.high_trust,
            _ => &self.standard,
        }
    }
}

/// An external program plus fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBinding {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    pub fn duet_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".duet"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::duet_dir()?.join("duet.toml"))
    }

    /// Directory holding per-run records.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::duet_dir()?.join("runs")),
        }
    }

    /// Load from the default path, apply `DUET_*` overrides and validate.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path` (defaults when missing), apply `DUET_*` overrides and
    /// validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        let mut config = if path.exists() {
            Self::from_toml_str(&fs::read_to_string(path)?)?
        } else {
            debug!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(
            max_retries = config.max_retries,
            max_parallel = config.max_parallel,
            floor = config.rejection_score_floor,
            margin = config.accept_margin,
            "Config loaded"
        );
        Ok(config)
    }

    /// Parse without overrides or validation.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let state_dir = self.state_dir()?;
        if !state_dir.exists() {
            debug!(dir = %state_dir.display(), "Creating state directory");
            fs::create_dir_all(&state_dir)?;
        }
        Ok(())
    }

    /// Apply `DUET_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("DUET_MAX_RETRIES") {
            self.max_retries = parse_override("DUET_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("DUET_MAX_PARALLEL") {
            self.max_parallel = parse_override("DUET_MAX_PARALLEL", &v)?;
        }
        if let Some(v) = lookup("DUET_SCORE_FLOOR") {
            self.rejection_score_floor = parse_override("DUET_SCORE_FLOOR", &v)?;
        }
        if let Some(v) = lookup("DUET_ACCEPT_MARGIN") {
            self.accept_margin = parse_override("DUET_ACCEPT_MARGIN", &v)?;
        }
        if let Some(v) = lookup("DUET_CONFIDENCE_THRESHOLD") {
            self.confidence_escalation_threshold =
                parse_override("DUET_CONFIDENCE_THRESHOLD", &v)?;
        }
        Ok(())
    }

    /// Check every invariant the run loop relies on.
    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(Error::Config("no criterion weights configured".into()));
        }
        if let Some((name, w)) = self.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(Error::Config(format!(
                "weight for '{}' must be a non-negative number, got {}",
                name, w
            )));
        }
        let sum: f64 = self.weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::Config(format!(
                "criterion weights must sum to 1.0, got {:.6}",
                sum
            )));
        }
        if self.max_parallel == 0 {
            return Err(Error::Config("max_parallel must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.rejection_score_floor) {
            return Err(Error::Config(format!(
                "rejection_score_floor must be within 0..=100, got {}",
                self.rejection_score_floor
            )));
        }
        if !(0.0..=100.0).contains(&self.accept_margin) {
            return Err(Error::Config(format!(
                "accept_margin must be within 0..=100, got {}",
                self.accept_margin
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_escalation_threshold) {
            return Err(Error::Config(format!(
                "confidence_escalation_threshold must be within 0..=1, got {}",
                self.confidence_escalation_threshold
            )));
        }
        if self.strategies.primary == self.strategies.secondary {
            return Err(Error::Config(format!(
                "primary and secondary strategies must differ (both are {})",
                self.strategies.primary
            )));
        }
        let t = &self.timeouts;
        if [t.simple, t.standard, t.important, t.critical].contains(&0) {
            return Err(Error::Config("tier timeouts must be at least 1 second".into()));
        }
        if self.evaluators.standard.is_empty() || self.evaluators.high_trust.is_empty() {
            return Err(Error::Config("evaluator profile names must not be empty".into()));
        }
        if self.evaluators.standard == self.evaluators.high_trust {
            return Err(Error::Config(
                "high_trust evaluator must differ from the standard evaluator".into(),
            ));
        }
        if self.escalation_poll_interval_secs == Some(0) {
            return Err(Error::Config(
                "escalation_poll_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout_for(&self, criticality: Criticality) -> Duration {
        self.timeouts.for_tier(criticality)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn escalation_poll_interval(&self) -> Option<Duration> {
        self.escalation_poll_interval_secs.map(Duration::from_secs)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: '{}'", key, value)))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
