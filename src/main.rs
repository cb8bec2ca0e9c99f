use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use duet::config::CommandBinding;
use duet::orchestration::{CommandExecutor, CommandScorer, PolicySink, ProgressEvent};
use duet::state::StateStore;
use duet::util::with_timeout;
use duet::{
    Config, Error, ExecutionStatus, JsonStateStore, Orchestrator, Result, RunId, RunSummary,
    TaskGraph,
};
use duet::core::{RunStats, Timing};

/// How long an interrupted run may take to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// duet - redundant-execution task orchestrator
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    DUET_DEBUG=1     Enable debug logging (alternative to --debug)\n    DUET_MAX_RETRIES, DUET_MAX_PARALLEL, DUET_SCORE_FLOOR,\n    DUET_ACCEPT_MARGIN, DUET_CONFIDENCE_THRESHOLD override the config file")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.duet/duet.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.duet/duet.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a task graph file and print its ready batches
    Validate {
        /// JSON task graph
        graph: PathBuf,
    },

    /// Execute a task graph
    Run {
        /// JSON task graph
        graph: PathBuf,

        /// Resume an earlier run instead of starting a new one
        #[arg(long)]
        run_id: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the recorded state of a run
    Status {
        /// Run ID (uses the most recent run if not specified)
        run_id: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    duet::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Validate { graph } => run_validate(&graph),
        Command::Run {
            graph,
            run_id,
            json,
        } => run_graph(config, &graph, run_id.as_deref(), json),
        Command::Status { run_id, json } => run_status(config, run_id.as_deref(), json),
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let graph = TaskGraph::load(path)?;
    println!(
        "{}: {} tasks, {} dependencies",
        path.display(),
        graph.len(),
        graph.edge_count()
    );
    for (i, batch) in graph.topological_batches().enumerate() {
        let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
        println!("  batch {}: {}", i + 1, ids.join(", "));
    }
    Ok(())
}

fn run_graph(config: Config, path: &Path, run_id: Option<&str>, json: bool) -> Result<()> {
    let graph = TaskGraph::load(path)?;
    let run_id = match run_id {
        Some(id) => parse_run_id(id)?,
        None => RunId::new(),
    };

    let executor = CommandExecutor::new(required_binding(&config.executor, "executor")?)?;
    let scorer = CommandScorer::new(required_binding(&config.scorer, "scorer")?)?;
    config.ensure_dirs()?;
    let state_dir = config.state_dir()?;
    let sink = Arc::new(PolicySink::new(config.rejection_score_floor));

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let store = Arc::new(JsonStateStore::new(&state_dir).await?);
        let orchestrator = Orchestrator::new(config, Arc::new(executor), Arc::new(scorer), store)?
            .with_sink(sink)
            .on_progress(|event| eprintln!("{}", format_event(event)));

        info!(run = %run_id, graph = %path.display(), "starting run");
        eprintln!("Run {} ({} tasks)", run_id, graph.len());

        let cancel = CancellationToken::new();
        let run = orchestrator.run(&graph, run_id, cancel.clone());
        tokio::pin!(run);
        tokio::select! {
            summary = &mut run => summary,
            _ = tokio::signal::ctrl_c() => {
                warn!(run = %run_id, "interrupted, cancelling run");
                eprintln!("Interrupted, cancelling run {}", run_id);
                cancel.cancel();
                with_timeout(SHUTDOWN_GRACE, run).await?
            }
        }
    })?;

    print_summary(&summary, json)?;
    if summary.cancelled {
        eprintln!("Resume with: duet run {} --run-id {}", path.display(), run_id);
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn run_status(config: Config, run_id: Option<&str>, json: bool) -> Result<()> {
    let state_dir = config.state_dir()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = JsonStateStore::new(&state_dir).await?;
        let run_id = match run_id {
            Some(id) => parse_run_id(id)?,
            None => latest_run(&store).await?,
        };

        match store.load_summary(&run_id).await? {
            Some(summary) => print_summary(&summary, json),
            None => {
                // Interrupted before the summary was written.
                let results = store.load_run(&run_id).await?;
                if results.is_empty() {
                    return Err(Error::Store(format!("no records for run {}", run_id)));
                }
                if json {
                    println!("{}", serde_json::to_string_pretty(&results)?);
                } else {
                    println!("Run {} (no summary, run did not finish)", run_id);
                    for result in &results {
                        println!("  {:<12} {}", result.task_id.as_str(), format_status(result.status));
                    }
                }
                Ok(())
            }
        }
    })
}

async fn latest_run(store: &JsonStateStore) -> Result<RunId> {
    let mut latest: Option<(RunId, chrono::DateTime<chrono::Utc>)> = None;
    for run_id in store.list_runs().await? {
        let Some(summary) = store.load_summary(&run_id).await? else {
            continue;
        };
        if latest.as_ref().map_or(true, |(_, at)| summary.started_at > *at) {
            latest = Some((run_id, summary.started_at));
        }
    }
    latest
        .map(|(id, _)| id)
        .ok_or_else(|| Error::Store("no finished runs recorded".into()))
}

fn required_binding<'a>(binding: &'a Option<CommandBinding>, name: &str) -> Result<&'a CommandBinding> {
    binding
        .as_ref()
        .ok_or_else(|| Error::Config(format!("[{}] command binding is required for `duet run`", name)))
}

fn parse_run_id(id: &str) -> Result<RunId> {
    id.parse()
        .map_err(|_| Error::Config(format!("invalid run id: {}", id)))
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!();
    println!("  Run ID:    {}", summary.run_id);
    println!(
        "  Duration:  {}s",
        (summary.finished_at - summary.started_at).num_seconds()
    );
    if summary.cancelled {
        println!("  Cancelled");
    }
    if summary.deadline_elapsed {
        println!("  Deadline elapsed");
    }
    println!();
    for result in &summary.results {
        let detail = result
            .detail
            .as_deref()
            .or_else(|| result.escalation.as_ref().and_then(|e| e.resolution.as_deref()))
            .unwrap_or("");
        println!(
            "  {:<12} {:<20} attempts={} {}",
            result.task_id.as_str(),
            format_status(result.status),
            result.attempts,
            truncate_string(detail, 60)
        );
    }
    println!();
    println!(
        "  {} completed, {} failed, {} escalated, {} rejected, {} skipped",
        summary.count(ExecutionStatus::Completed),
        summary.count(ExecutionStatus::Failed),
        summary.count(ExecutionStatus::Escalated),
        summary.count(ExecutionStatus::Rejected),
        summary.count(ExecutionStatus::Skipped),
    );
    for line in format_stats(&summary.stats) {
        println!("  {}", line);
    }
    Ok(())
}

fn format_timing(timing: &Timing) -> String {
    match (timing.avg_ms(), timing.min_ms, timing.max_ms) {
        (Some(avg), Some(min), Some(max)) => {
            format!("avg {:.0}ms, min {}ms, max {}ms", avg, min, max)
        }
        _ => "no calls".to_string(),
    }
}

fn format_stats(stats: &RunStats) -> Vec<String> {
    let mut lines = vec![String::new(), "Calls:".to_string()];
    for (strategy, s) in &stats.strategies {
        lines.push(format!(
            "  {:<18} {} calls, {} errors, {} unverified, {} tokens ({})",
            strategy.to_string(),
            s.calls,
            s.errors,
            s.failed_verification,
            s.tokens_used,
            format_timing(&s.timing)
        ));
    }
    lines.push(format!(
        "  {:<18} {} calls, {} errors ({})",
        "evaluator",
        stats.evaluator.calls,
        stats.evaluator.errors,
        format_timing(&stats.evaluator.timing)
    ));
    lines.push(format!("  {:<18} {}", "escalations", stats.escalations));
    lines
}

fn format_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::TaskCompleted { task_id, attempts } => {
            format!("[done]      {} after {} attempt(s)", task_id, attempts)
        }
        ProgressEvent::TaskFailed { task_id, detail } => {
            format!("[failed]    {}: {}", task_id, detail)
        }
        ProgressEvent::TaskEscalated {
            task_id,
            reason,
            pending,
        } => {
            let state = if *pending { "pending" } else { "unresolved" };
            format!("[escalated] {}: {} ({})", task_id, reason, state)
        }
        ProgressEvent::TaskRejected { task_id, reason } => {
            format!("[rejected]  {}: {}", task_id, reason)
        }
    }
}

/// Format task status with color codes for terminal.
fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        ExecutionStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),    // Red
        ExecutionStatus::Escalated => format!("\x1b[33m{}\x1b[0m", status), // Yellow
        ExecutionStatus::Rejected => format!("\x1b[35m{}\x1b[0m", status),  // Magenta
        ExecutionStatus::Skipped => format!("\x1b[90m{}\x1b[0m", status),   // Gray
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let truncated: String = s.chars().take(keep).collect();
    format!("{}...", truncated)
}
