//! Work command

use super::Context;
use anyhow::Result;
use clap::Args;
use console::style;
use folio_jobs::{BatchHooks, JobOutcome, JobRegistry, JobStatus, Worker, WorkerPool};
use serde_json::json;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Queue to poll; repeat for several, highest priority first
    #[arg(short, long = "queue")]
    pub queues: Vec<String>,

    /// Number of concurrent worker loops
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Process a single job and exit
    #[arg(long)]
    pub once: bool,

    /// Exit once every queue is empty
    #[arg(long)]
    pub stop_when_empty: bool,

    /// Exit after processing this many jobs per worker
    #[arg(long)]
    pub max_jobs: Option<u64>,

    /// Idle pause between polls, in milliseconds
    #[arg(long)]
    pub sleep: Option<u64>,

    /// Attempts for jobs that do not set their own
    #[arg(long)]
    pub tries: Option<u32>,

    /// Time budget in seconds for jobs that do not set their own
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn work(
    ctx: &Context,
    args: WorkArgs,
    registry: JobRegistry,
    hooks: BatchHooks,
) -> Result<()> {
    let mut options = ctx.config.worker_options();
    if !args.queues.is_empty() {
        options.queues = args.queues;
    }
    if let Some(ms) = args.sleep {
        options.sleep = Duration::from_millis(ms);
    }
    if let Some(tries) = args.tries {
        anyhow::ensure!(tries > 0, "--tries must be at least 1");
        options.max_tries = tries;
    }
    if let Some(secs) = args.timeout {
        options.timeout = Duration::from_secs(secs);
        anyhow::ensure!(
            options.timeout < options.lock_duration,
            "--timeout must be shorter than the worker lock of {}s",
            options.lock_duration.as_secs()
        );
    }
    options.stop_when_empty = args.stop_when_empty;
    options.max_jobs = args.max_jobs;

    let types = registry.registered_types().await;
    if types.is_empty() {
        tracing::warn!("No job types registered; every reserved job will fail to decode");
    } else {
        tracing::info!(job_types = ?types, "Registered job types");
    }

    let worker = Worker::new(ctx.store.clone(), registry, options).with_batches(hooks);

    if args.once {
        let outcome = worker.run_next().await?;
        return ctx.emit(&outcome.as_ref().map(outcome_json), |_| match &outcome {
            Some(outcome) => print_outcome(outcome),
            None => println!("{}", style("No job available").dim()),
        });
    }

    let count = args.workers.unwrap_or(ctx.config.worker_count).max(1);
    println!(
        "{} Processing jobs from {} with {} worker(s). Press Ctrl-C to stop.",
        style("▶").green(),
        style(worker.options().queues.join(", ")).cyan(),
        count
    );

    let pool = WorkerPool::spawn(worker, count);
    let handle = pool.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, finishing current jobs");
            handle.signal();
        }
    });

    let processed = pool.join().await;
    ctx.emit(&json!({ "processed": processed }), |_| {
        println!("{} Processed {} job(s)", style("✓").green(), processed);
    })
}

fn outcome_json(outcome: &JobOutcome) -> serde_json::Value {
    let (status, detail) = match &outcome.status {
        JobStatus::Succeeded => ("succeeded", None),
        JobStatus::Skipped => ("skipped", None),
        JobStatus::Retrying { delay } => ("retrying", Some(format!("{}s", delay.as_secs()))),
        JobStatus::Failed { reason } => ("failed", Some(reason.clone())),
        JobStatus::Superseded => ("superseded", None),
    };
    json!({
        "job_id": outcome.job_id,
        "queue": outcome.queue,
        "job_type": outcome.job_type,
        "attempt": outcome.attempt,
        "status": status,
        "detail": detail,
    })
}

fn print_outcome(outcome: &JobOutcome) {
    let label = format!("{} #{} on {}", outcome.job_type, outcome.job_id, outcome.queue);
    match &outcome.status {
        JobStatus::Succeeded => println!("{} {}", style("✓ done").green(), label),
        JobStatus::Skipped => println!("{} {} (batch cancelled)", style("- skipped").dim(), label),
        JobStatus::Retrying { delay } => println!(
            "{} {} (attempt {}, next in {}s)",
            style("↻ retrying").yellow(),
            label,
            outcome.attempt,
            delay.as_secs()
        ),
        JobStatus::Failed { reason } => {
            println!("{} {}: {}", style("✗ failed").red(), label, reason)
        }
        JobStatus::Superseded => println!(
            "{} {} (reservation expired, result discarded)",
            style("! superseded").yellow(),
            label
        ),
    }
}
