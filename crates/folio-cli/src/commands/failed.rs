//! Failed job commands

use super::{confirm, timestamp, Context};
use anyhow::Result;
use clap::Subcommand;
use console::style;
use serde_json::json;

#[derive(Subcommand, Debug)]
pub enum FailedCommand {
    /// List failed jobs, newest first
    List {
        #[arg(short, long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 25)]
        per_page: u32,
    },

    /// Show one failed job with its payload and error
    Show { id: i64 },

    /// Delete one failed job
    Forget { id: i64 },

    /// Delete every failed job
    Flush {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn failed(ctx: &Context, cmd: FailedCommand) -> Result<()> {
    match cmd {
        FailedCommand::List { page, per_page } => list(ctx, page, per_page).await,
        FailedCommand::Show { id } => show(ctx, id).await,
        FailedCommand::Forget { id } => {
            ctx.repo.delete_failed(id).await?;
            ctx.emit(&json!({ "forgotten": id }), |_| {
                println!("{} Failed job {} deleted", style("✓").green(), id);
            })
        }
        FailedCommand::Flush { force } => {
            if !confirm(force, "Delete every failed job?")? {
                return Ok(());
            }
            let deleted = ctx.repo.delete_all_failed().await?;
            ctx.emit(&json!({ "deleted": deleted }), |_| {
                println!("{} Deleted {} failed job(s)", style("✓").green(), deleted);
            })
        }
    }
}

async fn list(ctx: &Context, page: u32, per_page: u32) -> Result<()> {
    let page = ctx.repo.list_failed(page, per_page).await?;
    ctx.emit(&page, |page| {
        if page.items.is_empty() {
            println!("{}", style("No failed jobs").dim());
            return;
        }
        println!(
            "{:>6}  {:<24} {:<16} {:<19}  {}",
            style("ID").bold(),
            style("TYPE").bold(),
            style("QUEUE").bold(),
            style("FAILED AT").bold(),
            style("ERROR").bold()
        );
        for job in &page.items {
            println!(
                "{:>6}  {:<24} {:<16} {:<19}  {}",
                job.id,
                job.job_type,
                job.queue,
                timestamp(&job.failed_at),
                style(first_line(&job.exception)).red()
            );
        }
        println!(
            "{}",
            style(format!(
                "Page {} of {} ({} failed)",
                page.page,
                page.last_page(),
                page.total
            ))
            .dim()
        );
    })
}

async fn show(ctx: &Context, id: i64) -> Result<()> {
    let job = ctx.repo.find_failed(id).await?;
    ctx.emit(&job, |job| {
        println!("{}   {}", style("ID:").bold(), job.id);
        println!("{} {}", style("UUID:").bold(), job.uuid);
        println!("{} {}", style("Type:").bold(), style(&job.job_type).cyan());
        println!("{} {} ({})", style("Queue:").bold(), job.queue, job.connection);
        println!("{} {}", style("Failed:").bold(), timestamp(&job.failed_at));
        if let Some(batch_id) = job.batch_id {
            println!("{} {}", style("Batch:").bold(), batch_id);
        }
        println!("{}", style("Payload:").bold());
        println!(
            "{}",
            serde_json::to_string_pretty(&job.payload).unwrap_or_else(|_| job.payload.to_string())
        );
        println!("{}", style("Error:").bold());
        println!("{}", style(&job.exception).red());
    })
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
