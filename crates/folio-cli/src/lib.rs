//! # Folio Jobs CLI
//!
//! Operator commands for the job queue: run workers, inspect and clear
//! queues, retry failed jobs and manage batches.
//!
//! The `folio-jobs` binary knows no job types, so its `work` command is
//! only useful for draining queues of job types it can fail safely.
//! Applications ship their own binary that registers handlers first:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() {
//!     folio_cli::init_tracing();
//!     let registry = JobRegistry::new();
//!     registry.register(DepositDoi::new(client)).await;
//!     let cli = folio_cli::Cli::parse();
//!     if let Err(e) = cli.execute_with(registry, BatchHooks::new()).await {
//!         folio_cli::report(&e);
//!         std::process::exit(folio_cli::exit_code(&e));
//!     }
//! }
//! ```

mod cli;
mod commands;

pub use cli::Cli;

use console::style;
use folio_jobs::JobError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` selects the level, `info` by default. Does nothing when the
/// embedding application already installed a subscriber.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Exit code when the named job or batch does not exist. Kept apart from
/// clap's usage error code 2.
pub const EXIT_NOT_FOUND: i32 = 3;

/// Process exit code for a failed command: [`EXIT_NOT_FOUND`] when
/// something was not found, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.chain().find_map(|e| e.downcast_ref::<JobError>()) {
        Some(e) if e.is_not_found() => EXIT_NOT_FOUND,
        _ => 1,
    }
}

pub fn report(err: &anyhow::Error) {
    eprintln!("{} {:#}", style("error:").red().bold(), err);
}
