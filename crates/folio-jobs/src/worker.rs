//! Job workers
//!
//! A [`Worker`] reserves one job at a time from its queues, runs the
//! registered handler under a time budget and applies exactly one terminal
//! transition: delete on success, release for another attempt, or move to
//! the failed table. That transition applies only while the worker still
//! holds the reservation it ran the job under. Job failures never escape [`Worker::run`]; only store
//! errors are reported, and the loop keeps polling after them.

use crate::backoff::BackoffPolicy;
use crate::batch::BatchHooks;
use crate::dispatcher::DEFAULT_QUEUE;
use crate::error::{JobFailure, Result};
use crate::job::JobContext;
use crate::record::{BatchUpdate, FailedJobRecord, JobId, JobRecord};
use crate::registry::JobRegistry;
use crate::store::QueueStore;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Polled in order; the first queue with an eligible job wins.
    pub queues: Vec<String>,
    /// Idle pause between polls.
    pub sleep: Duration,
    /// Reservations older than this are treated as orphaned.
    pub lock_duration: Duration,
    /// Used when the job carries no `max_tries` of its own.
    pub max_tries: u32,
    /// Used when the job carries no timeout of its own.
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Return from [`Worker::run`] once every queue is empty.
    pub stop_when_empty: bool,
    pub max_jobs: Option<u64>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            sleep: Duration::from_secs(1),
            lock_duration: Duration::from_secs(90),
            max_tries: 3,
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            stop_when_empty: false,
            max_jobs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Succeeded,
    /// Member of a cancelled batch; deleted without running.
    Skipped,
    Retrying { delay: Duration },
    Failed { reason: String },
    /// The reservation expired and the job was taken over or cleared
    /// before this attempt finished; its result was discarded.
    Superseded,
}

/// What happened to the job a worker reserved.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    pub attempt: u32,
    pub status: JobStatus,
}

#[derive(Clone)]
pub struct Worker {
    id: String,
    store: Arc<dyn QueueStore>,
    registry: JobRegistry,
    hooks: BatchHooks,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(store: Arc<dyn QueueStore>, registry: JobRegistry, options: WorkerOptions) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("worker-{}", &suffix[..8]),
            store,
            registry,
            hooks: BatchHooks::default(),
            options,
        }
    }

    pub fn with_batches(mut self, hooks: BatchHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Reserve and process a single job, if any queue has one.
    pub async fn run_next(&self) -> Result<Option<JobOutcome>> {
        for queue in &self.options.queues {
            if let Some(job) = self
                .store
                .reserve_next(queue, self.options.lock_duration)
                .await?
            {
                return self.process(job).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Poll until shutdown is signalled, the queues run dry with
    /// `stop_when_empty`, or `max_jobs` jobs were processed.
    ///
    /// A shutdown signal never interrupts a running job. Returns the
    /// number of jobs processed.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> u64 {
        tracing::info!(worker_id = %self.id, queues = ?self.options.queues, "Job worker started");
        let mut processed = 0u64;
        let mut store_errors = 0u32;

        loop {
            if shutdown_requested(&mut shutdown) {
                tracing::info!(worker_id = %self.id, "Shutdown signal received");
                break;
            }
            if self.options.max_jobs.is_some_and(|max| processed >= max) {
                tracing::info!(worker_id = %self.id, processed, "Job limit reached");
                break;
            }

            let pause = match self.run_next().await {
                Ok(Some(_)) => {
                    processed += 1;
                    store_errors = 0;
                    continue;
                }
                Ok(None) => {
                    store_errors = 0;
                    if self.options.stop_when_empty {
                        tracing::info!(worker_id = %self.id, processed, "Queues empty");
                        break;
                    }
                    self.options.sleep
                }
                Err(e) => {
                    store_errors = store_errors.saturating_add(1);
                    tracing::error!(worker_id = %self.id, error = %e, "Error polling queue store");
                    poll_backoff().delay_for(store_errors)
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(worker_id = %self.id, "Shutdown signal received");
                    break;
                }
                _ = sleep(pause) => {}
            }
        }

        tracing::info!(worker_id = %self.id, processed, "Job worker stopped");
        processed
    }

    async fn process(&self, job: JobRecord) -> Result<JobOutcome> {
        tracing::debug!(
            worker_id = %self.id,
            job_id = %job.id,
            queue = %job.queue,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Job reserved"
        );
        let max_tries = job.max_tries.unwrap_or(self.options.max_tries).max(1);

        // An orphaned reservation can come back after its last allowed attempt.
        if job.attempts > max_tries {
            let failure = JobFailure::handler(format!(
                "attempted {} times, more than the allowed {}",
                job.attempts, max_tries
            ));
            return self.fail(job, failure).await;
        }

        if let Some(batch_id) = job.batch_id {
            let cancelled = self
                .store
                .find_batch(batch_id)
                .await?
                .is_some_and(|batch| batch.cancelled);
            if cancelled {
                let Some(settled) = self.store.complete(&job).await? else {
                    return Ok(self.superseded(&job));
                };
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    batch_id = %batch_id,
                    "Skipped job of cancelled batch"
                );
                self.after_success(&job, settled.batch).await;
                return Ok(outcome(&job, JobStatus::Skipped));
            }
        }

        match self.execute(&job).await {
            Ok(()) => {
                let Some(settled) = self.store.complete(&job).await? else {
                    return Ok(self.superseded(&job));
                };
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    queue = %job.queue,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    "Job completed successfully"
                );
                self.after_success(&job, settled.batch).await;
                Ok(outcome(&job, JobStatus::Succeeded))
            }
            Err(failure) if failure.is_retryable() && job.attempts < max_tries => {
                let delay = self.options.backoff.delay_for(job.attempts);
                if !self.store.release(&job, delay).await? {
                    return Ok(self.superseded(&job));
                }
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    queue = %job.queue,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    max_tries,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %failure.summary(),
                    "Job failed, will retry"
                );
                Ok(outcome(&job, JobStatus::Retrying { delay }))
            }
            Err(failure) => self.fail(job, failure).await,
        }
    }

    async fn execute(&self, job: &JobRecord) -> std::result::Result<(), JobFailure> {
        let handler = self.registry.resolve(&job.job_type).await.ok_or_else(|| {
            JobFailure::Deserialization(format!(
                "no handler registered for job type `{}`",
                job.job_type
            ))
        })?;

        let ctx = JobContext {
            job_id: job.id,
            queue: job.queue.clone(),
            attempt: job.attempts,
            created_at: job.created_at,
            batch_id: job.batch_id,
        };
        // Past the lock another worker may reserve the job while it runs.
        let mut budget = job.timeout().unwrap_or(self.options.timeout);
        if budget > self.options.lock_duration {
            tracing::warn!(
                worker_id = %self.id,
                job_id = %job.id,
                timeout_secs = budget.as_secs(),
                lock_secs = self.options.lock_duration.as_secs(),
                "Job timeout exceeds the worker lock, capping it"
            );
            budget = self.options.lock_duration;
        }
        let run = AssertUnwindSafe(handler.handle(ctx, job.payload.clone())).catch_unwind();

        match tokio::time::timeout(budget, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(JobFailure::handler(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(JobFailure::Timeout(budget)),
        }
    }

    async fn fail(&self, job: JobRecord, failure: JobFailure) -> Result<JobOutcome> {
        let reason = failure.summary();
        let Some(settled) = self.store.fail_permanently(&job, &reason).await? else {
            return Ok(self.superseded(&job));
        };
        tracing::error!(
            worker_id = %self.id,
            job_id = %job.id,
            queue = %job.queue,
            job_type = %job.job_type,
            attempt = job.attempts,
            failed_id = settled.record.id,
            error = %reason,
            "Job failed permanently"
        );

        match &settled.batch {
            Some(update) => self.after_failure(update, &settled.record).await,
            None => self.batch_gone(&job),
        }
        Ok(outcome(&job, JobStatus::Failed { reason }))
    }

    async fn after_success(&self, job: &JobRecord, update: Option<BatchUpdate>) {
        match update {
            Some(update) if update.finished => self.after_finish(&update).await,
            Some(_) => {}
            None => self.batch_gone(job),
        }
    }

    /// A batch pruned while its members were still queued has no counters
    /// left to update.
    fn batch_gone(&self, job: &JobRecord) {
        if let Some(batch_id) = job.batch_id {
            tracing::warn!(
                worker_id = %self.id,
                job_id = %job.id,
                batch_id = %batch_id,
                "Batch of finished job is gone"
            );
        }
    }

    fn superseded(&self, job: &JobRecord) -> JobOutcome {
        tracing::warn!(
            worker_id = %self.id,
            job_id = %job.id,
            queue = %job.queue,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Reservation lost before the job finished, result discarded"
        );
        outcome(job, JobStatus::Superseded)
    }

    async fn after_failure(&self, update: &BatchUpdate, failed: &FailedJobRecord) {
        if let Some(callbacks) = self.hooks.for_batch(&update.batch).await {
            if let Err(e) = callbacks.on_failure(&update.batch, failed).await {
                self.callback_error("on_failure", update, &e);
            }
        }
        if update.finished {
            self.after_finish(update).await;
        }
    }

    async fn after_finish(&self, update: &BatchUpdate) {
        let batch = &update.batch;
        tracing::info!(
            worker_id = %self.id,
            batch_id = %batch.id,
            total = batch.total_jobs,
            failed = batch.failed_jobs,
            cancelled = batch.cancelled,
            "Batch finished"
        );
        let Some(callbacks) = self.hooks.for_batch(batch).await else {
            return;
        };
        if !batch.has_failures() {
            if let Err(e) = callbacks.on_success(batch).await {
                self.callback_error("on_success", update, &e);
            }
        }
        if let Err(e) = callbacks.on_finished(batch).await {
            self.callback_error("on_finished", update, &e);
        }
    }

    fn callback_error(&self, callback: &str, update: &BatchUpdate, error: &JobFailure) {
        tracing::warn!(
            worker_id = %self.id,
            batch_id = %update.batch.id,
            callback,
            error = %error,
            "Batch callback failed"
        );
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn outcome(job: &JobRecord, status: JobStatus) -> JobOutcome {
    JobOutcome {
        job_id: job.id,
        queue: job.queue.clone(),
        job_type: job.job_type.clone(),
        attempt: job.attempts,
        status,
    }
}

fn shutdown_requested(shutdown: &mut mpsc::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    )
}

fn poll_backoff() -> BackoffPolicy {
    BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// N worker loops sharing one store
pub struct WorkerPool {
    workers: Vec<tokio::task::JoinHandle<u64>>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
}

impl WorkerPool {
    /// Spawn `count` copies of `worker`, named `<id>-0`, `<id>-1`, ...
    pub fn spawn(worker: Worker, count: usize) -> Self {
        let mut workers = Vec::with_capacity(count);
        let mut shutdown_txs = Vec::with_capacity(count);

        for i in 0..count {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let worker = worker.clone().with_id(format!("{}-{}", worker.id, i));
            workers.push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
            shutdown_txs.push(shutdown_tx);
        }

        Self {
            workers,
            shutdown_txs,
        }
    }

    /// A handle that can stop the pool from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            senders: self.shutdown_txs.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signal every worker and wait for each to finish its current job.
    pub async fn shutdown(self) -> u64 {
        tracing::info!(workers = self.workers.len(), "Shutting down worker pool...");
        self.shutdown_handle().signal();
        let processed = self.join().await;
        tracing::info!(processed, "Worker pool shut down");
        processed
    }

    /// Wait for the workers to stop on their own, e.g. with
    /// `stop_when_empty` or `max_jobs`.
    pub async fn join(self) -> u64 {
        let mut processed = 0;
        for worker in self.workers {
            match worker.await {
                Ok(n) => processed += n,
                Err(e) => tracing::error!(error = %e, "Worker task ended abnormally"),
            }
        }
        // Senders live until every worker has returned.
        drop(self.shutdown_txs);
        processed
    }
}

/// Stops every worker of a [`WorkerPool`] once its current job is done.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    senders: Vec<mpsc::Sender<()>>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        for tx in &self.senders {
            // Full or closed both mean the worker is already stopping.
            let _ = tx.try_send(());
        }
    }
}
