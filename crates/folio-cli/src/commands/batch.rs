//! Batch commands

use super::{timestamp, Context};
use anyhow::Result;
use clap::Subcommand;
use console::style;
use folio_jobs::{Batch, BatchId};
use serde_json::json;
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum BatchCommand {
    /// Show a batch and its progress
    Show { id: BatchId },

    /// Cancel a batch; members that have not started are skipped
    Cancel { id: BatchId },

    /// List batches, newest first
    List {
        #[arg(short, long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 25)]
        per_page: u32,
    },

    /// Delete finished batches older than the given age
    Prune {
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
}

pub async fn batch(ctx: &Context, cmd: BatchCommand) -> Result<()> {
    match cmd {
        BatchCommand::Show { id } => {
            let batch = ctx.repo.batch(id).await?;
            ctx.emit(&batch, print_batch)
        }
        BatchCommand::Cancel { id } => {
            let batch = ctx.repo.cancel_batch(id).await?;
            ctx.emit(&batch, |batch| {
                println!(
                    "{} Batch {} cancelled, {} job(s) still pending",
                    style("✓").green(),
                    batch.id,
                    batch.pending_jobs
                );
            })
        }
        BatchCommand::List { page, per_page } => {
            let page = ctx.repo.list_batches(page, per_page).await?;
            ctx.emit(&page, |page| {
                if page.items.is_empty() {
                    println!("{}", style("No batches").dim());
                    return;
                }
                for batch in &page.items {
                    println!(
                        "{}  {:<24} {:>3}%  {}/{} done, {} failed  {}",
                        batch.id,
                        batch.name,
                        batch.progress(),
                        batch.processed_jobs(),
                        batch.total_jobs,
                        batch.failed_jobs,
                        state(batch)
                    );
                }
            })
        }
        BatchCommand::Prune { hours } => {
            let pruned = ctx
                .repo
                .prune_batches(Duration::from_secs(hours.saturating_mul(3600)))
                .await?;
            ctx.emit(&json!({ "pruned": pruned }), |_| {
                println!("{} Pruned {} batch(es)", style("✓").green(), pruned);
            })
        }
    }
}

fn state(batch: &Batch) -> console::StyledObject<&'static str> {
    if batch.cancelled {
        style("cancelled").red()
    } else if batch.finished() {
        style("finished").green()
    } else {
        style("running").yellow()
    }
}

fn print_batch(batch: &Batch) {
    println!("{} {}", style("Batch:").bold(), batch.id);
    println!("{}  {}", style("Name:").bold(), batch.name);
    println!("{} {}", style("State:").bold(), state(batch));
    println!(
        "{} {}% ({} of {} done, {} pending)",
        style("Progress:").bold(),
        batch.progress(),
        batch.processed_jobs(),
        batch.total_jobs,
        batch.pending_jobs
    );
    println!("{} {}", style("Failed:").bold(), batch.failed_jobs);
    if !batch.failed_job_ids.is_empty() {
        let ids: Vec<String> = batch.failed_job_ids.iter().map(|id| id.to_string()).collect();
        println!("{} {}", style("Failed ids:").bold(), ids.join(", "));
    }
    println!("{} {}", style("Created:").bold(), timestamp(&batch.created_at));
    if let Some(at) = batch.cancelled_at {
        println!("{} {}", style("Cancelled:").bold(), timestamp(&at));
    }
    if let Some(at) = batch.finished_at {
        println!("{} {}", style("Finished:").bold(), timestamp(&at));
    }
}
