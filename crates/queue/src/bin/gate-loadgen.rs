//! gate-loadgen: synthetic workload driver for `Batch`.
//!
//! Pushes `--tasks` sleeping tasks with cycling priorities through one batch,
//! failing every `--fail-every`-th task, then prints a JSON report:
//!
//! ```text
//! gate-loadgen --tasks 200 --concurrency 8 --mode all-settled
//! ```

use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use gate_core::GateConfig;
use gate_queue::{Batch, BatchStats, EnqueueOptions, Priority};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Mode {
    /// Stop waiting at the first failure.
    FailFast,
    /// Wait for every task and report all failures.
    AllSettled,
}

/// Drive a batch of synthetic tasks and report how it went.
#[derive(Parser, Debug)]
#[command(name = "gate-loadgen", version, about)]
struct Cli {
    /// Path to a gate.toml config file. Env-only config when omitted.
    #[arg(long, env = "GATE_CONFIG")]
    config: Option<String>,

    /// Number of tasks to submit.
    #[arg(long, default_value_t = 100)]
    tasks: usize,

    /// Override the batch concurrency from config.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override the batch max queue length from config.
    #[arg(long)]
    max_queue_length: Option<usize>,

    /// Base task duration in milliseconds.
    #[arg(long, default_value_t = 10)]
    task_millis: u64,

    /// Fail every n-th task (0 disables failures).
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Completion contract to wait on.
    #[arg(long, value_enum, default_value_t = Mode::AllSettled)]
    mode: Mode,
}

// ── Report ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Report {
    mode: Mode,
    tasks: usize,
    failed: usize,
    first_error: Option<String>,
    submit_ms: u64,
    elapsed_ms: u64,
    stats: BatchStats,
}

fn load_config(cli: &Cli) -> GateConfig {
    let mut config = match &cli.config {
        Some(path) => match GateConfig::from_file(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded gate config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using env defaults");
                GateConfig::from_env()
            }
        },
        None => GateConfig::from_env(),
    };
    if let Some(concurrency) = cli.concurrency {
        config.batch.concurrency = concurrency;
    }
    if let Some(max) = cli.max_queue_length {
        config.batch.max_queue_length = Some(max);
    }
    config
}

/// Priorities cycle 0..=4 so waiting tasks interleave.
fn priority_for(index: usize) -> Priority {
    (index % 5) as Priority
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    gate_core::load_dotenv();
    let cli = Cli::parse();
    let config = load_config(&cli);
    config.log_summary();

    let batch: Batch<String> = Batch::new(&config.batch);
    let started = Instant::now();

    for index in 0..cli.tasks {
        let fails = cli.fail_every > 0 && (index + 1) % cli.fail_every == 0;
        let millis = cli.task_millis + (index % 3) as u64;
        batch
            .add(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    if fails {
                        Err(format!("task {index} failed"))
                    } else {
                        Ok(())
                    }
                },
                EnqueueOptions::priority(priority_for(index)),
            )
            .await;
    }
    let submit_ms = started.elapsed().as_millis() as u64;
    info!(tasks = cli.tasks, submit_ms, "all tasks submitted");

    let first_error = match cli.mode {
        Mode::FailFast => batch.fail_fast().await.err(),
        Mode::AllSettled => batch
            .all_settled()
            .await
            .err()
            .and_then(|errors| errors.into_errors().into_iter().next()),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    // Fail-fast returns early; let the stragglers settle before reporting.
    let _ = batch.all_settled().await;

    let stats = batch.stats();
    let report = Report {
        mode: cli.mode,
        tasks: cli.tasks,
        failed: stats.failed,
        first_error,
        submit_ms,
        elapsed_ms,
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
