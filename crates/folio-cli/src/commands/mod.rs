//! CLI commands

mod batch;
mod failed;
mod queue;
mod retry;
mod work;

pub use batch::{batch, BatchCommand};
pub use failed::{failed, FailedCommand};
pub use queue::{clear, count, flush, list, queues, ListArgs};
pub use retry::{retry, RetryArgs};
pub use work::{work, WorkArgs};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm};
use folio_jobs::{JobRepository, QueueConfig, QueueStore};
use serde::Serialize;
use std::sync::Arc;

/// Everything a command needs, resolved once from the environment.
pub struct Context {
    pub config: QueueConfig,
    pub store: Arc<dyn QueueStore>,
    pub repo: JobRepository,
    pub json: bool,
}

impl Context {
    pub async fn load(connection: Option<String>, json: bool) -> Result<Self> {
        let mut config = QueueConfig::from_env().context("invalid queue configuration")?;
        if let Some(connection) = connection {
            config.connection = connection;
        }
        let store = config
            .connect()
            .await
            .with_context(|| format!("could not open queue connection `{}`", config.connection))?;
        tracing::debug!(connection = %config.connection, "Queue store ready");

        Ok(Self {
            repo: JobRepository::new(store.clone()),
            config,
            store,
            json,
        })
    }

    /// Print `value` as JSON when `--json` was given, otherwise run `human`.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

/// Ask before destructive commands; `--force` skips the prompt.
fn confirm(force: bool, prompt: &str) -> Result<bool> {
    if force {
        return Ok(true);
    }
    if !Term::stdout().is_term() {
        anyhow::bail!("refusing to continue without --force in a non-interactive session");
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    if !confirmed {
        println!("{}", style("Aborted").yellow());
    }
    Ok(confirmed)
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
