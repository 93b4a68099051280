//! Read and management operations over the active, failed and batch tables.
//!
//! Every call is a single store operation, so administration never
//! sidesteps the atomicity workers rely on.

use crate::clock::{self, Clock};
use crate::error::{JobError, Result};
use crate::record::{Batch, BatchId, FailedJobRecord, JobId, JobRecord, Page, PageRequest, QueueSize};
use crate::store::QueueStore;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
}

impl JobRepository {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn list_pending(
        &self,
        queue: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Page<JobRecord>> {
        self.store.list_pending(queue, page_request(page, per_page)?).await
    }

    pub async fn count(&self, queue: Option<&str>) -> Result<u64> {
        self.store.count(queue).await
    }

    pub async fn queues(&self) -> Result<Vec<QueueSize>> {
        self.store.queues().await
    }

    pub async fn delete_from_queue(&self, queue: &str) -> Result<u64> {
        let deleted = self.store.delete_from_queue(queue).await?;
        tracing::info!(queue, deleted, "Cleared queue");
        Ok(deleted)
    }

    pub async fn delete_all(&self) -> Result<u64> {
        let deleted = self.store.delete_all().await?;
        tracing::info!(deleted, "Cleared all queues");
        Ok(deleted)
    }

    pub async fn list_failed(&self, page: u32, per_page: u32) -> Result<Page<FailedJobRecord>> {
        self.store.list_failed(page_request(page, per_page)?).await
    }

    pub async fn count_failed(&self) -> Result<u64> {
        self.store.count_failed().await
    }

    pub async fn find_failed(&self, id: i64) -> Result<FailedJobRecord> {
        self.store
            .find_failed(id)
            .await?
            .ok_or_else(|| failed_not_found(id))
    }

    pub async fn delete_failed(&self, id: i64) -> Result<()> {
        if !self.store.delete_failed(id).await? {
            return Err(failed_not_found(id));
        }
        tracing::info!(failed_id = id, "Forgot failed job");
        Ok(())
    }

    pub async fn delete_all_failed(&self) -> Result<u64> {
        let deleted = self.store.delete_all_failed().await?;
        tracing::info!(deleted, "Flushed failed jobs");
        Ok(deleted)
    }

    /// Re-enqueue a failed job as a fresh record. `NotFound` leaves
    /// everything untouched.
    pub async fn retry_failed(&self, id: i64) -> Result<JobId> {
        let job_id = self.store.retry_failed(id).await?;
        tracing::info!(failed_id = id, job_id = %job_id, "Failed job pushed back onto the queue");
        Ok(job_id)
    }

    /// Retry every failed job, oldest first.
    pub async fn retry_all_failed(&self) -> Result<Vec<JobId>> {
        let total = self.store.count_failed().await?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let all = self
            .store
            .list_failed(PageRequest::new(1, total.min(u32::MAX as u64) as u32))
            .await?;

        let mut retried = Vec::with_capacity(all.items.len());
        for failed in all.items.iter().rev() {
            match self.store.retry_failed(failed.id).await {
                Ok(id) => retried.push(id),
                // Retried or forgotten by someone else in the meantime.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(retried = retried.len(), "Retried failed jobs");
        Ok(retried)
    }

    pub async fn batch(&self, id: BatchId) -> Result<Batch> {
        self.store
            .find_batch(id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("batch {}", id)))
    }

    pub async fn list_batches(&self, page: u32, per_page: u32) -> Result<Page<Batch>> {
        self.store.list_batches(page_request(page, per_page)?).await
    }

    pub async fn cancel_batch(&self, id: BatchId) -> Result<Batch> {
        self.store.cancel_batch(id).await
    }

    /// Delete finished batches created more than `older_than` ago.
    pub async fn prune_batches(&self, older_than: Duration) -> Result<u64> {
        let before = clock::before(self.clock.now(), older_than);
        let pruned = self.store.prune_batches(before).await?;
        tracing::info!(pruned, before = %before, "Pruned finished batches");
        Ok(pruned)
    }
}

impl std::fmt::Debug for JobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRepository").finish_non_exhaustive()
    }
}

fn page_request(page: u32, per_page: u32) -> Result<PageRequest> {
    if per_page == 0 {
        return Err(JobError::Config("per_page must be at least 1".into()));
    }
    Ok(PageRequest::new(page, per_page))
}

fn failed_not_found(id: i64) -> JobError {
    JobError::NotFound(format!("failed job {}", id))
}
