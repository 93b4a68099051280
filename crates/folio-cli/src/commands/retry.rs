//! Retry command

use super::Context;
use anyhow::Result;
use clap::Args;
use console::style;
use folio_jobs::JobError;
use serde_json::json;

#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Failed job ids to retry
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub ids: Vec<i64>,

    /// Retry every failed job
    #[arg(long)]
    pub all: bool,
}

pub async fn retry(ctx: &Context, args: RetryArgs) -> Result<()> {
    let retried = if args.all {
        ctx.repo.retry_all_failed().await?
    } else {
        // Check every id first so a typo leaves the failed table untouched.
        let mut missing = Vec::new();
        for &id in &args.ids {
            match ctx.repo.find_failed(id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => missing.push(id.to_string()),
                Err(e) => return Err(e.into()),
            }
        }
        if !missing.is_empty() {
            return Err(JobError::NotFound(format!("failed job(s) {}", missing.join(", "))).into());
        }

        let mut retried = Vec::with_capacity(args.ids.len());
        for &id in &args.ids {
            retried.push(ctx.repo.retry_failed(id).await?);
        }
        retried
    };

    ctx.emit(&json!({ "retried": retried }), |_| {
        if retried.is_empty() {
            println!("{}", style("No failed jobs to retry").dim());
        } else {
            println!(
                "{} Pushed {} job(s) back onto the queue",
                style("✓").green(),
                retried.len()
            );
        }
    })
}
