use crate::error::JobFailure;
use crate::record::{BatchId, JobId};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Context passed to job execution
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    /// 1-based number of the attempt being run.
    pub attempt: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub batch_id: Option<BatchId>,
}

/// A job that can be executed
///
/// The job value itself is the long-lived handler registered with a
/// [`JobRegistry`](crate::JobRegistry); the per-dispatch arguments travel
/// as `Data` through the queue store. Handlers may run more than once for
/// the same dispatch, so their side effects must be idempotent.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stable type key written into every payload.
    const NAME: &'static str;

    /// The data required by the job
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Execute the job
    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<(), JobFailure>;

    /// Retry ceiling for this job type when the dispatcher sets none.
    fn max_tries() -> Option<u32> {
        None
    }

    /// Execution budget for this job type when the dispatcher sets none.
    fn timeout() -> Option<Duration> {
        None
    }
}

/// A type-erased job handler
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<(), JobFailure>;
}

#[async_trait]
impl<J: Job> JobHandler for J {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<(), JobFailure> {
        let data: J::Data = serde_json::from_value(data)
            .map_err(|e| JobFailure::Deserialization(format!("{}: {}", J::NAME, e)))?;
        self.execute(ctx, data).await
    }
}
