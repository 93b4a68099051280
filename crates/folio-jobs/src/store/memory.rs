use super::QueueStore;
use crate::clock::{self, Clock};
use crate::error::{JobError, Result};
use crate::record::{
    Batch, BatchId, BatchUpdate, FailedJobRecord, JobId, JobRecord, NewJob, Page, PageRequest,
    QueueSize, Settled,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, JobRecord>,
    failed: BTreeMap<i64, FailedJobRecord>,
    batches: HashMap<BatchId, Batch>,
    next_job_id: i64,
    next_failed_id: i64,
}

impl State {
    fn insert_job(&mut self, job: NewJob) -> JobId {
        self.next_job_id += 1;
        let id = JobId(self.next_job_id);
        self.jobs.insert(id, job.into_record(id));
        id
    }

    fn batch_mut(&mut self, id: BatchId) -> Result<&mut Batch> {
        self.batches
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(format!("batch {}", id)))
    }

    fn holds(&self, held: &JobRecord) -> bool {
        self.jobs
            .get(&held.id)
            .is_some_and(|job| job.holds_reservation(held))
    }

    fn settle_batch(
        &mut self,
        job: &JobRecord,
        failed: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Option<BatchUpdate> {
        let batch = self.batches.get_mut(&job.batch_id?)?;
        let finished = batch.settle_member(failed, now);
        Some(BatchUpdate {
            batch: batch.clone(),
            finished,
        })
    }
}

/// In-memory queue store (not persistent, for testing/dev)
///
/// A single mutex guards every table, so each operation is atomic with
/// respect to all other callers sharing this instance (clones included).
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| JobError::StoreUnavailable("Lock poisoned".to_string()))
    }

    /// Look at a job without reserving it.
    pub fn peek(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let mut state = self.lock()?;
        if let Some(batch_id) = job.batch_id {
            let batch = state.batch_mut(batch_id)?;
            if batch.finished() {
                return Err(JobError::InvalidBatch(format!(
                    "batch {} has already finished",
                    batch_id
                )));
            }
            batch.total_jobs += 1;
            batch.pending_jobs += 1;
        }
        Ok(state.insert_job(job))
    }

    async fn reserve_next(
        &self,
        queue: &str,
        lock_duration: Duration,
    ) -> Result<Option<JobRecord>> {
        let now = self.clock.now();
        let mut state = self.lock()?;

        let next = state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_eligible(now, lock_duration))
            .min_by_key(|job| (job.available_at, job.id))
            .map(|job| job.id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|job| {
                job.reserved_at = Some(now);
                job.attempts += 1;
                job.clone()
            })
        }))
    }

    async fn complete(&self, job: &JobRecord) -> Result<Option<Settled<()>>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if !state.holds(job) {
            return Ok(None);
        }
        state.jobs.remove(&job.id);
        let batch = state.settle_batch(job, None, now);
        Ok(Some(Settled { record: (), batch }))
    }

    async fn release(&self, job: &JobRecord, delay: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if !state.holds(job) {
            return Ok(false);
        }
        if let Some(stored) = state.jobs.get_mut(&job.id) {
            stored.reserved_at = None;
            stored.available_at = clock::after(now, delay);
        }
        Ok(true)
    }

    async fn fail_permanently(
        &self,
        job: &JobRecord,
        error: &str,
    ) -> Result<Option<Settled<FailedJobRecord>>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if !state.holds(job) {
            return Ok(None);
        }
        state.jobs.remove(&job.id);
        state.next_failed_id += 1;
        let failed = FailedJobRecord {
            id: state.next_failed_id,
            uuid: Uuid::new_v4(),
            connection: job.connection.clone(),
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            max_tries: job.max_tries,
            timeout_seconds: job.timeout_seconds,
            batch_id: job.batch_id,
            exception: error.to_string(),
            failed_at: now,
        };
        state.failed.insert(failed.id, failed.clone());
        let batch = state.settle_batch(job, Some(job.id), now);
        Ok(Some(Settled {
            record: failed,
            batch,
        }))
    }

    async fn create_batch(
        &self,
        mut batch: Batch,
        jobs: Vec<NewJob>,
    ) -> Result<(BatchId, Vec<JobId>)> {
        let mut state = self.lock()?;
        let batch_id = batch.id;
        batch.total_jobs = jobs.len() as u32;
        batch.pending_jobs = jobs.len() as u32;
        if jobs.is_empty() {
            batch.finished_at = Some(self.clock.now());
        }
        state.batches.insert(batch_id, batch);

        let ids = jobs
            .into_iter()
            .map(|mut job| {
                job.batch_id = Some(batch_id);
                state.insert_job(job)
            })
            .collect();
        Ok((batch_id, ids))
    }

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.lock()?.batches.get(&id).cloned())
    }

    async fn cancel_batch(&self, id: BatchId) -> Result<Batch> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let batch = state.batch_mut(id)?;
        if !batch.cancelled {
            batch.cancelled = true;
            batch.cancelled_at = Some(now);
        }
        Ok(batch.clone())
    }

    async fn list_batches(&self, page: PageRequest) -> Result<Page<Batch>> {
        let mut batches: Vec<Batch> = self.lock()?.batches.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::from_slice(batches, page))
    }

    async fn prune_batches(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let start = state.batches.len();
        state
            .batches
            .retain(|_, batch| !(batch.finished() && batch.created_at < before));
        Ok((start - state.batches.len()) as u64)
    }

    async fn list_pending(&self, queue: &str, page: PageRequest) -> Result<Page<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .lock()?
            .jobs
            .values()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.available_at, job.id));
        Ok(Page::from_slice(jobs, page))
    }

    async fn count(&self, queue: Option<&str>) -> Result<u64> {
        let state = self.lock()?;
        let count = match queue {
            Some(queue) => state.jobs.values().filter(|job| job.queue == queue).count(),
            None => state.jobs.len(),
        };
        Ok(count as u64)
    }

    async fn queues(&self) -> Result<Vec<QueueSize>> {
        let state = self.lock()?;
        let mut sizes: BTreeMap<&str, QueueSize> = BTreeMap::new();
        for job in state.jobs.values() {
            let size = sizes.entry(job.queue.as_str()).or_insert_with(|| QueueSize {
                queue: job.queue.clone(),
                pending: 0,
                reserved: 0,
            });
            if job.is_reserved() {
                size.reserved += 1;
            } else {
                size.pending += 1;
            }
        }
        Ok(sizes.into_values().collect())
    }

    async fn delete_from_queue(&self, queue: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let start = state.jobs.len();
        state.jobs.retain(|_, job| job.queue != queue);
        Ok((start - state.jobs.len()) as u64)
    }

    async fn delete_all(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let removed = state.jobs.len() as u64;
        state.jobs.clear();
        Ok(removed)
    }

    async fn list_failed(&self, page: PageRequest) -> Result<Page<FailedJobRecord>> {
        // Newest failures first.
        let failed: Vec<FailedJobRecord> = self.lock()?.failed.values().rev().cloned().collect();
        Ok(Page::from_slice(failed, page))
    }

    async fn count_failed(&self) -> Result<u64> {
        Ok(self.lock()?.failed.len() as u64)
    }

    async fn find_failed(&self, id: i64) -> Result<Option<FailedJobRecord>> {
        Ok(self.lock()?.failed.get(&id).cloned())
    }

    async fn delete_failed(&self, id: i64) -> Result<bool> {
        Ok(self.lock()?.failed.remove(&id).is_some())
    }

    async fn delete_all_failed(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let removed = state.failed.len() as u64;
        state.failed.clear();
        Ok(removed)
    }

    async fn retry_failed(&self, id: i64) -> Result<JobId> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let failed = state
            .failed
            .remove(&id)
            .ok_or_else(|| JobError::NotFound(format!("failed job {}", id)))?;
        Ok(state.insert_job(failed.to_new_job(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn new_job(queue: &str, now: DateTime<Utc>, delay_secs: i64) -> NewJob {
        NewJob {
            connection: "memory".into(),
            queue: queue.into(),
            job_type: "noop".into(),
            payload: serde_json::json!({}),
            max_tries: None,
            timeout_seconds: None,
            batch_id: None,
            available_at: now + chrono::Duration::seconds(delay_secs),
            created_at: now,
        }
    }

    const LOCK: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn reserve_orders_by_availability_then_id() {
        let clock = ManualClock::default();
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let now = clock.now();

        let late = store.enqueue(new_job("default", now, 5)).await.unwrap();
        let first = store.enqueue(new_job("default", now, 0)).await.unwrap();
        let second = store.enqueue(new_job("default", now, 0)).await.unwrap();
        clock.advance(Duration::from_secs(10));

        let order: Vec<JobId> = [
            store.reserve_next("default", LOCK).await.unwrap(),
            store.reserve_next("default", LOCK).await.unwrap(),
            store.reserve_next("default", LOCK).await.unwrap(),
        ]
        .into_iter()
        .map(|job| job.unwrap().id)
        .collect();

        assert_eq!(order, vec![first, second, late]);
        assert!(store.reserve_next("default", LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_ignores_other_queues() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_job("mail", Utc::now(), 0))
            .await
            .unwrap();

        assert!(store.reserve_next("default", LOCK).await.unwrap().is_none());
        assert!(store.reserve_next("mail", LOCK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_clears_reservation_and_delays() {
        let clock = ManualClock::default();
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let id = store
            .enqueue(new_job("default", clock.now(), 0))
            .await
            .unwrap();

        let job = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(store.release(&job, Duration::from_secs(30)).await.unwrap());

        let released = store.peek(id).unwrap().unwrap();
        assert!(released.reserved_at.is_none());
        assert!(store.reserve_next("default", LOCK).await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        let again = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn retry_failed_moves_row_back() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_job("default", Utc::now(), 0))
            .await
            .unwrap();
        let job = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        let failed = store
            .fail_permanently(&job, "boom")
            .await
            .unwrap()
            .unwrap()
            .record;

        assert_eq!(store.count(None).await.unwrap(), 0);
        let new_id = store.retry_failed(failed.id).await.unwrap();

        assert_ne!(new_id, job.id);
        assert_eq!(store.count_failed().await.unwrap(), 0);
        let fresh = store.peek(new_id).unwrap().unwrap();
        assert_eq!(fresh.attempts, 0);
        assert!(matches!(
            store.retry_failed(failed.id).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_into_unknown_batch_fails() {
        let store = InMemoryStore::new();
        let mut job = new_job("default", Utc::now(), 0);
        job.batch_id = Some(BatchId::new());

        assert!(store.enqueue(job).await.unwrap_err().is_not_found());
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_reservation_cannot_settle() {
        let clock = ManualClock::default();
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let id = store
            .enqueue(new_job("default", clock.now(), 0))
            .await
            .unwrap();

        let stale = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        clock.advance(LOCK + Duration::from_secs(1));
        let current = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        assert_eq!(current.id, id);
        assert_eq!(current.attempts, 2);

        assert!(store.complete(&stale).await.unwrap().is_none());
        assert!(!store.release(&stale, Duration::ZERO).await.unwrap());
        assert!(store.fail_permanently(&stale, "late").await.unwrap().is_none());
        assert_eq!(store.count_failed().await.unwrap(), 0);
        assert_eq!(store.peek(id).unwrap().unwrap().attempts, 2);

        assert!(store.complete(&current).await.unwrap().is_some());
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleared_job_is_not_moved_to_failed() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_job("mail", Utc::now(), 0))
            .await
            .unwrap();
        let job = store.reserve_next("mail", LOCK).await.unwrap().unwrap();
        store.delete_from_queue("mail").await.unwrap();

        assert!(store.fail_permanently(&job, "boom").await.unwrap().is_none());
        assert_eq!(store.count_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn complete_settles_batch_in_the_same_step() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let batch = Batch::new("pair", Default::default(), now);
        let (batch_id, _) = store
            .create_batch(batch, vec![new_job("default", now, 0), new_job("default", now, 0)])
            .await
            .unwrap();

        let first = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        let settled = store.complete(&first).await.unwrap().unwrap();
        let update = settled.batch.unwrap();
        assert_eq!(update.batch.id, batch_id);
        assert_eq!(update.batch.pending_jobs, 1);
        assert!(!update.finished);

        let second = store.reserve_next("default", LOCK).await.unwrap().unwrap();
        let failed = store.fail_permanently(&second, "boom").await.unwrap().unwrap();
        let update = failed.batch.unwrap();
        assert!(update.finished);
        assert_eq!(update.batch.failed_job_ids, vec![second.id]);
    }
}
