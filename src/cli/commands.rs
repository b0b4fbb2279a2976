//! CLI command definitions for taskbeat.
//!
//! Every command loads [`EngineConfig`] from the environment first and then
//! applies the flags given on the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::beat::ScheduleTable;
use crate::config::EngineConfig;
use crate::dispatcher::{RevokeOutcome, DEFAULT_REDRIVE_GRACE};
use crate::engine::Backends;
use crate::metrics::{export_metrics, init_metrics};
use crate::monitor::MonitorSnapshot;
use crate::task::{TaskId, TaskOptions, TaskState};

/// Distributed periodic task scheduler and worker.
#[derive(Parser)]
#[command(name = "taskbeat")]
#[command(about = "Schedule, queue and execute background tasks")]
#[command(version)]
#[command(
    long_about = "taskbeat runs periodic and on-demand tasks across a pool of workers.\n\nTasks are queued on Redis and tracked in PostgreSQL.\n\nExample usage:\n  taskbeat migrate\n  taskbeat worker --beat --schedule schedules/sync.yaml\n  taskbeat submit sync.reservations --args '{\"period\": \"day\"}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Broker URL (redis://... or memory://).
    #[arg(long, env = "TASKBEAT_BROKER_URL", global = true)]
    pub broker_url: Option<String>,

    /// Result store URL (postgres://... or memory://).
    #[arg(long, env = "TASKBEAT_RESULT_STORE_URL", global = true)]
    pub result_store_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker pool, optionally with an embedded beat scheduler.
    Worker(WorkerArgs),

    /// Run the beat scheduler alone.
    Beat(BeatArgs),

    /// Submit a task.
    Submit(SubmitArgs),

    /// Revoke a task.
    Revoke(RevokeArgs),

    /// Show the status of a task.
    Status(StatusArgs),

    /// Show queue depth, workers and task counts.
    Monitor(MonitorArgs),

    /// Validate a schedule file and print its next run times.
    Schedule(ScheduleArgs),

    /// Create the result store tables.
    Migrate,
}

/// Arguments for `taskbeat worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent executors.
    #[arg(short = 'c', long, env = "TASKBEAT_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Comma-separated queues, highest priority first.
    #[arg(short = 'Q', long, env = "TASKBEAT_QUEUES")]
    pub queues: Option<String>,

    /// Also run the beat scheduler in this process.
    #[arg(short = 'B', long, requires = "schedule")]
    pub beat: bool,

    /// Schedule file used with --beat.
    #[arg(short = 's', long, env = "TASKBEAT_SCHEDULE_FILE")]
    pub schedule: Option<PathBuf>,
}

/// Arguments for `taskbeat beat`.
#[derive(Parser, Debug)]
pub struct BeatArgs {
    /// Schedule file (YAML).
    #[arg(short = 's', long, env = "TASKBEAT_SCHEDULE_FILE")]
    pub schedule: PathBuf,
}

/// Arguments for `taskbeat submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Registered task name.
    pub task: String,

    /// JSON arguments.
    #[arg(short = 'a', long, default_value = "[]")]
    pub args: String,

    /// Target queue.
    #[arg(short = 'q', long)]
    pub queue: Option<String>,

    /// Delay in seconds before the task becomes visible.
    #[arg(long, conflicts_with = "eta")]
    pub countdown: Option<u64>,

    /// Earliest execution time (RFC 3339).
    #[arg(long)]
    pub eta: Option<DateTime<Utc>>,

    /// Retry budget.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Deduplication key.
    #[arg(short = 'k', long)]
    pub idempotency_key: Option<String>,
}

/// Arguments for `taskbeat revoke`.
#[derive(Parser, Debug)]
pub struct RevokeArgs {
    /// Task id.
    pub task_id: TaskId,
}

/// Arguments for `taskbeat status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task id.
    pub task_id: TaskId,

    /// Include the status history.
    #[arg(long)]
    pub history: bool,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Prometheus,
}

/// Arguments for `taskbeat monitor`.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Output format.
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Refresh every --interval seconds until interrupted.
    #[arg(short = 'w', long, conflicts_with = "follow")]
    pub watch: bool,

    /// Refresh interval in seconds.
    #[arg(long, default_value = "5")]
    pub interval: u64,

    /// Stream status transitions instead of snapshots.
    #[arg(long)]
    pub follow: bool,

    /// Transition cursor to follow from (0 replays the whole history).
    #[arg(long, default_value = "0")]
    pub cursor: i64,
}

/// Arguments for `taskbeat schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Schedule file (YAML).
    pub file: PathBuf,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = cli.broker_url {
        config = config.with_broker_url(url);
    }
    if let Some(url) = cli.result_store_url {
        config = config.with_result_store_url(url);
    }

    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Beat(args) => run_beat_command(config, args).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Revoke(args) => run_revoke_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Monitor(args) => run_monitor_command(config, args).await,
        Commands::Schedule(args) => run_schedule_command(args),
        Commands::Migrate => run_migrate_command(config).await,
    }
}

// ============================================================================
// Long-running roles
// ============================================================================

async fn run_worker_command(mut config: EngineConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(queues) = args.queues.as_deref() {
        config = config.with_queues(queues.split(',').map(str::trim).filter(|q| !q.is_empty()));
    }
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry already initialized");
    }
    let backends = Backends::connect(&config).await?;
    let registry = backends.registry(&config);
    let dispatcher = Arc::new(backends.dispatcher().with_known_tasks(registry.names()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let beat_handle = if args.beat {
        let path = args
            .schedule
            .as_deref()
            .context("--beat requires --schedule")?;
        let table = load_schedule(path)?;
        let mut beat = backends.beat(&config, table, Arc::clone(&dispatcher));
        let rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { beat.run(rx).await }))
    } else {
        None
    };

    let redrive_handle = {
        let dispatcher = Arc::clone(&dispatcher);
        let mut rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_REDRIVE_GRACE);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        match dispatcher.redrive_unenqueued(DEFAULT_REDRIVE_GRACE).await {
                            Ok(0) => {}
                            Ok(n) => info!(count = n, "Redrove un-enqueued tasks"),
                            Err(e) => warn!(error = %e, "Redrive failed"),
                        }
                    }
                }
            }
        })
    };

    let mut pool = backends.worker_pool(&config, registry);
    pool.start().await?;
    info!(
        worker_id = %pool.config().worker_id,
        concurrency = config.concurrency,
        queues = ?config.queues,
        beat = args.beat,
        "Worker started"
    );

    wait_for_shutdown().await;
    info!("Shutting down worker");
    let _ = shutdown_tx.send(());

    let pool_result = pool.shutdown().await;
    if let Some(handle) = beat_handle {
        let _ = handle.await;
    }
    let _ = redrive_handle.await;

    let stats = pool.stats();
    info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        retried = stats.retried,
        revoked = stats.revoked,
        "Worker stopped"
    );
    pool_result?;
    Ok(())
}

async fn run_beat_command(config: EngineConfig, args: BeatArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry already initialized");
    }
    let table = load_schedule(&args.schedule)?;
    let backends = Backends::connect(&config).await?;
    let dispatcher = Arc::new(backends.dispatcher());
    let mut beat = backends.beat(&config, table, dispatcher);

    info!(
        entries = beat.table().len(),
        tick_secs = config.beat_tick.as_secs(),
        "Beat scheduler started"
    );

    let (shutdown_tx, rx) = broadcast::channel::<()>(1);
    let handle = tokio::spawn(async move { beat.run(rx).await });

    wait_for_shutdown().await;
    info!("Shutting down beat scheduler");
    let _ = shutdown_tx.send(());
    handle.await.context("Beat scheduler task failed")?;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn load_schedule(path: &Path) -> anyhow::Result<ScheduleTable> {
    ScheduleTable::from_yaml_file(path, Utc::now())
        .with_context(|| format!("Failed to load schedule {}", path.display()))
}

// ============================================================================
// Producer commands
// ============================================================================

async fn run_submit_command(config: EngineConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let task_args: Value = serde_json::from_str(&args.args)
        .with_context(|| format!("--args is not valid JSON: {}", args.args))?;

    let mut options = TaskOptions::new();
    if let Some(queue) = args.queue {
        options = options.with_queue(queue);
    }
    if let Some(secs) = args.countdown {
        options = options.with_countdown(Duration::from_secs(secs));
    }
    if let Some(eta) = args.eta {
        options = options.with_eta(eta);
    }
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }
    if let Some(key) = args.idempotency_key {
        options = options.with_idempotency_key(key);
    }

    let backends = Backends::connect(&config).await?;
    let task_id = backends
        .dispatcher()
        .submit(&args.task, task_args, options)
        .await?;
    println!("{}", task_id);
    Ok(())
}

async fn run_revoke_command(config: EngineConfig, args: RevokeArgs) -> anyhow::Result<()> {
    let backends = Backends::connect(&config).await?;
    match backends.dispatcher().revoke(args.task_id).await? {
        RevokeOutcome::Revoked => println!("{} revoked", args.task_id),
        RevokeOutcome::SignalledRunning => {
            println!("{} is running, revoke signalled", args.task_id)
        }
        RevokeOutcome::AlreadyFinished(state) => {
            println!("{} already finished with {}", args.task_id, state)
        }
    }
    Ok(())
}

async fn run_status_command(config: EngineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let backends = Backends::connect(&config).await?;
    let monitor = backends.monitor();
    let record = monitor
        .status(args.task_id)
        .await?
        .with_context(|| format!("Task {} not found", args.task_id))?;
    let history = if args.history {
        monitor.history(args.task_id).await?
    } else {
        Vec::new()
    };

    if args.json {
        let output = serde_json::json!({
            "record": record,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Task:     {} ({})", record.task_id, record.task_name);
    println!("Queue:    {}", record.queue);
    println!("Status:   {}", record.status);
    println!("Retries:  {}", record.retries);
    if let Some(worker) = &record.worker_id {
        println!("Worker:   {}", worker);
    }
    if let Some(value) = &record.value {
        println!("Result:   {}", value);
    }
    if let Some(error) = &record.error {
        println!("Error:    {}", error);
    }
    for t in &history {
        let from = t.from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "  #{:<6} {} {:>8} -> {:<8} {}",
            t.seq,
            t.at.format("%Y-%m-%d %H:%M:%S%.3f"),
            from,
            t.to,
            t.detail.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

// ============================================================================
// Observation
// ============================================================================

async fn run_monitor_command(config: EngineConfig, args: MonitorArgs) -> anyhow::Result<()> {
    let backends = Backends::connect(&config).await?;
    let monitor = backends.monitor();

    if args.follow {
        let mut stream = monitor
            .feed(args.cursor)
            .with_poll_interval(Duration::from_secs(args.interval.max(1)))
            .into_stream();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                next = stream.next() => match next {
                    Some(t) if args.format == OutputFormat::Json => {
                        println!("{}", serde_json::to_string(&t)?);
                    }
                    Some(t) => println!(
                        "#{} {} {} {} -> {}",
                        t.seq,
                        t.at.to_rfc3339(),
                        t.task_id,
                        t.from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                        t.to
                    ),
                    None => break,
                },
            }
        }
        return Ok(());
    }

    if args.format == OutputFormat::Prometheus {
        if let Err(e) = init_metrics() {
            warn!(error = %e, "Metrics registry already initialized");
        }
    }

    loop {
        let snapshot = monitor.refresh_metrics().await;
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            OutputFormat::Prometheus => print!("{}", export_metrics()),
            OutputFormat::Text => print_snapshot(&snapshot),
        }
        if !args.watch {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(args.interval.max(1))) => {}
        }
    }
}

fn print_snapshot(snapshot: &MonitorSnapshot) {
    println!(
        "=== taskbeat @ {}{} ===",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S"),
        if snapshot.stale { " (stale)" } else { "" }
    );
    for error in &snapshot.errors {
        println!("  ! {}", error);
    }

    println!("Queues:");
    if snapshot.queues.is_empty() {
        println!("  (none)");
    }
    for q in &snapshot.queues {
        println!(
            "  {:<20} ready {:>6}  delayed {:>6}  leased {:>6}",
            q.queue, q.ready, q.delayed, q.leased
        );
    }

    println!(
        "Workers: {} active / {} known",
        snapshot.active_workers,
        snapshot.workers.len()
    );
    for w in &snapshot.workers {
        println!(
            "  {:<32} {:<5} active {:>3}/{:<3} processed {:>8}  last seen {}",
            w.heartbeat.worker_id,
            if w.alive { "up" } else { "gone" },
            w.heartbeat.active,
            w.heartbeat.concurrency,
            w.heartbeat.processed,
            w.heartbeat.last_seen.format("%H:%M:%S")
        );
    }

    println!("Tasks:");
    for state in TaskState::ALL {
        println!("  {:<8} {}", state, snapshot.status_counts.get(state));
    }
}

// ============================================================================
// Maintenance
// ============================================================================

fn run_schedule_command(args: ScheduleArgs) -> anyhow::Result<()> {
    let table = load_schedule(&args.file)?;
    println!("{} entries in {}", table.len(), args.file.display());
    for entry in table.snapshot() {
        let next = entry
            .next_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<24} {:<20} next {}{}",
            entry.name,
            entry.task_name,
            entry.trigger.to_string(),
            next,
            if entry.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

async fn run_migrate_command(config: EngineConfig) -> anyhow::Result<()> {
    let backends = Backends::connect(&config).await?;
    let applied = backends.migrate().await?;
    println!("✓ Result store ready ({} statements applied)", applied);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_worker() {
        let cli = Cli::try_parse_from([
            "taskbeat",
            "worker",
            "-c",
            "8",
            "-Q",
            "default,reports",
            "--beat",
            "--schedule",
            "schedules/sync.yaml",
        ])
        .unwrap();
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.concurrency, Some(8));
                assert_eq!(args.queues.as_deref(), Some("default,reports"));
                assert!(args.beat);
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "taskbeat",
            "submit",
            "sync.reservations",
            "--args",
            r#"{"period": "day"}"#,
            "--eta",
            "2030-01-01T00:00:00Z",
            "-k",
            "daily-2030-01-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.task, "sync.reservations");
                assert!(args.eta.is_some());
                assert_eq!(args.idempotency_key.as_deref(), Some("daily-2030-01-01"));
            }
            _ => panic!("expected submit command"),
        }
    }

    #[test]
    fn test_countdown_conflicts_with_eta() {
        let result = Cli::try_parse_from([
            "taskbeat",
            "submit",
            "t",
            "--countdown",
            "10",
            "--eta",
            "2030-01-01T00:00:00Z",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_status_rejects_bad_id() {
        assert!(Cli::try_parse_from(["taskbeat", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_parse_monitor_format() {
        let cli = Cli::try_parse_from(["taskbeat", "monitor", "-f", "json"]).unwrap();
        match cli.command {
            Commands::Monitor(args) => assert_eq!(args.format, OutputFormat::Json),
            _ => panic!("expected monitor command"),
        }
    }
}
