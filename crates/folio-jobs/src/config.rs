//! Queue configuration loaded from the environment.
//!
//! Every field maps to a `FOLIO_QUEUE_`-prefixed variable, e.g.
//! `FOLIO_QUEUE_MAX_TRIES=5` or `FOLIO_QUEUE_CONNECTION=postgres`. A `.env`
//! file in the working directory is read first when present.

use crate::backoff::{BackoffPolicy, BackoffStrategy};
use crate::error::{JobError, Result};
use crate::store::memory::InMemoryStore;
use crate::store::QueueStore;
use crate::worker::WorkerOptions;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const ENV_PREFIX: &str = "FOLIO_QUEUE_";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Default connection: `memory`, `postgres` or `redis`.
    #[serde(default = "default_connection")]
    pub connection: String,

    #[serde(default = "default_queue")]
    pub default_queue: String,

    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// How long an idle worker sleeps between polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which a reservation is considered orphaned.
    #[serde(default = "default_worker_lock_seconds")]
    pub worker_lock_seconds: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,

    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,

    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: u64,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub table_prefix: String,

    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            default_queue: default_queue(),
            max_tries: default_max_tries(),
            timeout_seconds: default_timeout_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_lock_seconds: default_worker_lock_seconds(),
            worker_count: default_worker_count(),
            backoff_strategy: BackoffStrategy::default(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_max_seconds: default_backoff_max_seconds(),
            database_url: None,
            table_prefix: String::new(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from `.env` and `FOLIO_QUEUE_*` variables
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| JobError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tries == 0 {
            return Err(JobError::Config("max_tries must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(JobError::Config("worker_count must be at least 1".into()));
        }
        if self.worker_lock_seconds <= self.timeout_seconds {
            return Err(JobError::Config(format!(
                "worker_lock_seconds ({}) must exceed timeout_seconds ({}) or running jobs would be reserved twice",
                self.worker_lock_seconds, self.timeout_seconds
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_lock(&self) -> Duration {
        Duration::from_secs(self.worker_lock_seconds)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            strategy: self.backoff_strategy,
            base: Duration::from_secs(self.backoff_base_seconds),
            max: Duration::from_secs(self.backoff_max_seconds),
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            queues: vec![self.default_queue.clone()],
            sleep: self.poll_interval(),
            lock_duration: self.worker_lock(),
            max_tries: self.max_tries,
            timeout: self.timeout(),
            backoff: self.backoff(),
            ..WorkerOptions::default()
        }
    }

    /// Open the store for the configured default connection.
    pub async fn connect(&self) -> Result<Arc<dyn QueueStore>> {
        self.connect_named(&self.connection).await
    }

    pub async fn connect_named(&self, connection: &str) -> Result<Arc<dyn QueueStore>> {
        match connection {
            "memory" => Ok(Arc::new(InMemoryStore::new())),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let url = self.database_url.as_deref().ok_or_else(|| {
                    JobError::Config("FOLIO_QUEUE_DATABASE_URL is required for postgres".into())
                })?;
                let store =
                    crate::store::postgres::PostgresStore::connect(url, &self.table_prefix).await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
            #[cfg(feature = "redis")]
            "redis" => {
                let url = self.redis_url.as_deref().ok_or_else(|| {
                    JobError::Config("FOLIO_QUEUE_REDIS_URL is required for redis".into())
                })?;
                Ok(Arc::new(crate::store::redis::RedisStore::new(
                    url,
                    &self.redis_prefix,
                )?))
            }
            other => Err(JobError::Config(format!(
                "unknown or disabled queue connection `{}`",
                other
            ))),
        }
    }
}

fn default_connection() -> String {
    "memory".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_max_tries() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_lock_seconds() -> u64 {
    90
}

fn default_worker_count() -> usize {
    1
}

fn default_backoff_base_seconds() -> u64 {
    2
}

fn default_backoff_max_seconds() -> u64 {
    86_400
}

fn default_redis_prefix() -> String {
    "folio".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = QueueConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.worker_lock(), Duration::from_secs(90));
    }

    #[test]
    fn reads_prefixed_variables() {
        let config = QueueConfig::from_vars(vars(&[
            ("FOLIO_QUEUE_MAX_TRIES", "7"),
            ("FOLIO_QUEUE_DEFAULT_QUEUE", "deposits"),
            ("FOLIO_QUEUE_BACKOFF_STRATEGY", "linear"),
            ("MAX_TRIES", "1"),
        ]))
        .unwrap();

        assert_eq!(config.max_tries, 7);
        assert_eq!(config.default_queue, "deposits");
        assert_eq!(config.backoff().strategy, BackoffStrategy::Linear);
        assert_eq!(config.worker_options().queues, vec!["deposits".to_string()]);
    }

    #[test]
    fn rejects_lock_shorter_than_timeout() {
        let err = QueueConfig::from_vars(vars(&[
            ("FOLIO_QUEUE_TIMEOUT_SECONDS", "120"),
            ("FOLIO_QUEUE_WORKER_LOCK_SECONDS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, JobError::Config(_)));
    }

    #[test]
    fn rejects_zero_tries() {
        assert!(QueueConfig::from_vars(vars(&[("FOLIO_QUEUE_MAX_TRIES", "0")])).is_err());
    }

    #[tokio::test]
    async fn unknown_connection_is_a_config_error() {
        let config = QueueConfig::default();
        assert!(matches!(
            config.connect_named("sqs").await,
            Err(JobError::Config(_))
        ));
    }
}
