//! Active job commands: list, count, clear, flush, queues

use super::{confirm, timestamp, Context};
use anyhow::Result;
use clap::Args;
use console::style;
use serde_json::json;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Queue to list; the configured default queue when omitted
    #[arg(short, long)]
    pub queue: Option<String>,

    #[arg(short, long, default_value_t = 1)]
    pub page: u32,

    #[arg(long, default_value_t = 25)]
    pub per_page: u32,
}

pub async fn list(ctx: &Context, args: ListArgs) -> Result<()> {
    let queue = args
        .queue
        .unwrap_or_else(|| ctx.config.default_queue.clone());
    let page = ctx.repo.list_pending(&queue, args.page, args.per_page).await?;

    ctx.emit(&page, |page| {
        if page.items.is_empty() {
            println!("{}", style(format!("No jobs on queue `{}`", queue)).dim());
            return;
        }
        println!(
            "{:>8}  {:<28} {:>8}  {:<19}  {}",
            style("ID").bold(),
            style("TYPE").bold(),
            style("ATTEMPTS").bold(),
            style("AVAILABLE AT").bold(),
            style("STATE").bold()
        );
        for job in &page.items {
            let state = if job.is_reserved() {
                style("reserved").yellow()
            } else {
                style("pending").green()
            };
            println!(
                "{:>8}  {:<28} {:>8}  {:<19}  {}",
                job.id,
                job.job_type,
                job.attempts,
                timestamp(&job.available_at),
                state
            );
        }
        println!(
            "{}",
            style(format!(
                "Page {} of {} ({} jobs)",
                page.page,
                page.last_page(),
                page.total
            ))
            .dim()
        );
    })
}

pub async fn count(ctx: &Context, queue: Option<String>) -> Result<()> {
    let total = ctx.repo.count(queue.as_deref()).await?;
    ctx.emit(&json!({ "queue": queue, "count": total }), |_| {
        println!("{}", total);
    })
}

pub async fn clear(ctx: &Context, queue: &str, force: bool) -> Result<()> {
    if !confirm(force, &format!("Delete every job on queue `{}`?", queue))? {
        return Ok(());
    }
    let deleted = ctx.repo.delete_from_queue(queue).await?;
    ctx.emit(&json!({ "queue": queue, "deleted": deleted }), |_| {
        println!(
            "{} Cleared {} job(s) from `{}`",
            style("✓").green(),
            deleted,
            queue
        );
    })
}

pub async fn flush(ctx: &Context, force: bool) -> Result<()> {
    if !confirm(force, "Delete every active job on every queue?")? {
        return Ok(());
    }
    let deleted = ctx.repo.delete_all().await?;
    ctx.emit(&json!({ "deleted": deleted }), |_| {
        println!("{} Deleted {} job(s)", style("✓").green(), deleted);
    })
}

pub async fn queues(ctx: &Context) -> Result<()> {
    let sizes = ctx.repo.queues().await?;
    ctx.emit(&sizes, |sizes| {
        if sizes.is_empty() {
            println!("{}", style("All queues are empty").dim());
            return;
        }
        println!(
            "{:<24} {:>8} {:>9}",
            style("QUEUE").bold(),
            style("PENDING").bold(),
            style("RESERVED").bold()
        );
        for size in sizes {
            println!("{:<24} {:>8} {:>9}", size.queue, size.pending, size.reserved);
        }
    })
}
