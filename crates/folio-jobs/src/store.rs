use crate::error::Result;
use crate::record::{
    Batch, BatchId, FailedJobRecord, JobId, JobRecord, NewJob, Page, PageRequest, QueueSize,
    Settled,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Persistent storage for jobs, failed jobs and batches.
///
/// Every method is one atomic state transition against the store. Worker
/// processes share nothing but the store, so implementations must not
/// rely on in-process locking for correctness across processes.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // === Job lifecycle ===

    /// Insert a job. When the job belongs to a batch, the batch counters
    /// are incremented in the same transition.
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Reserve the next eligible job on `queue`.
    ///
    /// Eligible means `available_at <= now` and either unreserved or
    /// reserved longer ago than `lock_duration`. Lowest `available_at`
    /// wins, then lowest id. The returned record already carries the new
    /// `reserved_at` and incremented `attempts`.
    async fn reserve_next(&self, queue: &str, lock_duration: Duration)
        -> Result<Option<JobRecord>>;

    // Terminal transitions take the record `reserve_next` returned and
    // apply only while the store still holds that same reservation. They
    // return `None`/`false` when it expired and was taken over, or the job
    // was cleared, and then change nothing.

    /// Remove a finished job and, for a batch member, count it as done in
    /// the same transition.
    async fn complete(&self, job: &JobRecord) -> Result<Option<Settled<()>>>;

    /// Hand a reserved job back for another attempt after `delay`.
    async fn release(&self, job: &JobRecord, delay: Duration) -> Result<bool>;

    /// Move a job to the failed table and, for a batch member, count it as
    /// failed in the same transition.
    async fn fail_permanently(
        &self,
        job: &JobRecord,
        error: &str,
    ) -> Result<Option<Settled<FailedJobRecord>>>;

    // === Batches ===

    /// Store a batch and all of its member jobs at once.
    async fn create_batch(&self, batch: Batch, jobs: Vec<NewJob>) -> Result<(BatchId, Vec<JobId>)>;

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>>;

    async fn cancel_batch(&self, id: BatchId) -> Result<Batch>;

    async fn list_batches(&self, page: PageRequest) -> Result<Page<Batch>>;

    /// Delete finished batches created before `before`.
    async fn prune_batches(&self, before: DateTime<Utc>) -> Result<u64>;

    // === Administration ===

    async fn list_pending(&self, queue: &str, page: PageRequest) -> Result<Page<JobRecord>>;

    async fn count(&self, queue: Option<&str>) -> Result<u64>;

    async fn queues(&self) -> Result<Vec<QueueSize>>;

    async fn delete_from_queue(&self, queue: &str) -> Result<u64>;

    async fn delete_all(&self) -> Result<u64>;

    async fn list_failed(&self, page: PageRequest) -> Result<Page<FailedJobRecord>>;

    async fn count_failed(&self) -> Result<u64>;

    async fn find_failed(&self, id: i64) -> Result<Option<FailedJobRecord>>;

    async fn delete_failed(&self, id: i64) -> Result<bool>;

    async fn delete_all_failed(&self) -> Result<u64>;

    /// Re-enqueue a failed job as a fresh record and drop the failed row.
    async fn retry_failed(&self, id: i64) -> Result<JobId>;
}
