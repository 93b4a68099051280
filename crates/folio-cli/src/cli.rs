//! CLI argument parsing

use crate::commands::{self, BatchCommand, Context, FailedCommand, ListArgs, RetryArgs, WorkArgs};
use clap::{Parser, Subcommand};
use folio_jobs::{BatchHooks, JobRegistry};

/// Folio Jobs - run workers and manage the background job queue
#[derive(Parser, Debug)]
#[command(name = "folio-jobs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Queue connection to use instead of FOLIO_QUEUE_CONNECTION
    #[arg(long, global = true)]
    connection: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process jobs from one or more queues
    Work(WorkArgs),

    /// List pending jobs of a queue
    List(ListArgs),

    /// Count active jobs
    Count {
        /// Only count this queue
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Delete every job of a queue
    Clear {
        queue: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Delete every active job on every queue
    Flush {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Inspect and manage failed jobs
    #[command(subcommand)]
    Failed(FailedCommand),

    /// Push failed jobs back onto their queue
    Retry(RetryArgs),

    /// Inspect and manage batches
    #[command(subcommand)]
    Batch(BatchCommand),

    /// Show pending and reserved jobs per queue
    Queues,
}

impl Cli {
    /// Execute the CLI command without any registered job types
    pub async fn execute(self) -> anyhow::Result<()> {
        self.execute_with(JobRegistry::new(), BatchHooks::new())
            .await
    }

    /// Execute the CLI command; `work` runs the job types in `registry`
    pub async fn execute_with(self, registry: JobRegistry, hooks: BatchHooks) -> anyhow::Result<()> {
        let ctx = Context::load(self.connection, self.json).await?;

        match self.command {
            Commands::Work(args) => commands::work(&ctx, args, registry, hooks).await,
            Commands::List(args) => commands::list(&ctx, args).await,
            Commands::Count { queue } => commands::count(&ctx, queue).await,
            Commands::Clear { queue, force } => commands::clear(&ctx, &queue, force).await,
            Commands::Flush { force } => commands::flush(&ctx, force).await,
            Commands::Failed(cmd) => commands::failed(&ctx, cmd).await,
            Commands::Retry(args) => commands::retry(&ctx, args).await,
            Commands::Batch(cmd) => commands::batch(&ctx, cmd).await,
            Commands::Queues => commands::queues(&ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn work_accepts_repeated_queues() {
        let cli = Cli::try_parse_from([
            "folio-jobs", "work", "--queue", "deposits", "--queue", "mail", "--once",
        ])
        .unwrap();

        match cli.command {
            Commands::Work(args) => {
                assert_eq!(args.queues, vec!["deposits", "mail"]);
                assert!(args.once);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn retry_needs_ids_or_all() {
        assert!(Cli::try_parse_from(["folio-jobs", "retry"]).is_err());
        assert!(Cli::try_parse_from(["folio-jobs", "retry", "3", "--all"]).is_err());
        assert!(Cli::try_parse_from(["folio-jobs", "retry", "--all"]).is_ok());
    }

    #[test]
    fn batch_ids_must_be_uuids() {
        assert!(Cli::try_parse_from(["folio-jobs", "batch", "show", "not-a-batch"]).is_err());
        assert!(Cli::try_parse_from([
            "folio-jobs",
            "batch",
            "show",
            "6f1c1d7d-5c6a-4f0e-8b3e-1f2a3b4c5d6e"
        ])
        .is_ok());
    }
}
