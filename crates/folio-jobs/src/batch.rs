//! Batches: groups of jobs that share completion callbacks.
//!
//! A batch and all of its initial members are written in one store
//! transition, so workers never observe a partial batch. Workers report
//! every terminal member transition back to the batch; the update that
//! drains `pending_jobs` is the only one that reports `finished`, which is
//! what makes `on_finished` fire exactly once across any number of
//! workers.

use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::{JobError, JobFailure, Result};
use crate::job::Job;
use crate::record::{Batch, BatchId, BatchOptions, FailedJobRecord, JobId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Lifecycle callbacks for a batch, looked up by key when a member settles.
#[async_trait]
pub trait BatchCallbacks: Send + Sync {
    /// All members finished and none failed.
    async fn on_success(&self, _batch: &Batch) -> std::result::Result<(), JobFailure> {
        Ok(())
    }

    /// A member exhausted its attempts. Fires once per failed member.
    async fn on_failure(
        &self,
        _batch: &Batch,
        _job: &FailedJobRecord,
    ) -> std::result::Result<(), JobFailure> {
        Ok(())
    }

    /// Every member reached a terminal state, failures included.
    async fn on_finished(&self, _batch: &Batch) -> std::result::Result<(), JobFailure> {
        Ok(())
    }
}

/// Callback sets keyed by the name stored in [`BatchOptions::callbacks`].
#[derive(Clone, Default)]
pub struct BatchHooks {
    callbacks: Arc<RwLock<HashMap<String, Arc<dyn BatchCallbacks>>>>,
}

impl BatchHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, key: impl Into<String>, callbacks: impl BatchCallbacks + 'static) {
        let key = key.into();
        let mut map = self.callbacks.write().await;
        if map.insert(key.clone(), Arc::new(callbacks)).is_some() {
            tracing::warn!(callbacks = %key, "Replaced existing batch callbacks");
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<dyn BatchCallbacks>> {
        self.callbacks.read().await.get(key).cloned()
    }

    pub(crate) async fn for_batch(&self, batch: &Batch) -> Option<Arc<dyn BatchCallbacks>> {
        let key = batch.options.callbacks.as_deref()?;
        let found = self.get(key).await;
        if found.is_none() {
            tracing::warn!(
                batch_id = %batch.id,
                callbacks = key,
                "No batch callbacks registered under this key"
            );
        }
        found
    }
}

impl std::fmt::Debug for BatchHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHooks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct PendingMember {
    job_type: &'static str,
    payload: serde_json::Value,
    max_tries: Option<u32>,
    timeout: Option<Duration>,
}

/// A batch that has not been dispatched yet.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    name: String,
    options: BatchOptions,
    members: Vec<PendingMember>,
}

impl BatchBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BatchOptions::default(),
            members: Vec::new(),
        }
    }

    /// Add a member job. Fails if `data` cannot be serialized.
    pub fn add<J: Job>(mut self, data: J::Data) -> Result<Self> {
        self.members.push(PendingMember {
            job_type: J::NAME,
            payload: serde_json::to_value(data)?,
            max_tries: J::max_tries(),
            timeout: J::timeout(),
        });
        Ok(self)
    }

    /// Keep running the remaining members after one fails permanently.
    pub fn allow_failures(mut self, allow: bool) -> Self {
        self.options.allow_failures = allow;
        self
    }

    pub fn callbacks(mut self, key: impl Into<String>) -> Self {
        self.options.callbacks = Some(key.into());
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.options.connection = Some(connection.into());
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Creates, extends and cancels batches.
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    dispatcher: Dispatcher,
}

impl BatchCoordinator {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Write the batch and its members in one store transition.
    pub async fn dispatch(&self, builder: BatchBuilder) -> Result<BatchId> {
        let BatchBuilder {
            name,
            options,
            members,
        } = builder;
        let connection = options
            .connection
            .clone()
            .unwrap_or_else(|| self.dispatcher.default_connection().to_string());
        let store = self.dispatcher.store(Some(&connection))?;

        let batch = Batch::new(name, options, self.dispatcher.now());
        let jobs = members
            .into_iter()
            .map(|member| {
                let mut opts = DispatchOptions::new().in_batch(batch.id);
                opts.queue = batch.options.queue.clone();
                opts.max_tries = member.max_tries;
                opts.timeout = member.timeout;
                self.dispatcher
                    .build(connection.clone(), member.job_type, member.payload, &opts)
            })
            .collect::<Vec<_>>();

        let size = jobs.len();
        let (id, _) = store.create_batch(batch, jobs).await?;
        tracing::info!(batch_id = %id, jobs = size, "Batch dispatched");
        Ok(id)
    }

    /// Push another job into a batch that has not finished yet.
    pub async fn add<J: Job>(&self, id: BatchId, data: J::Data) -> Result<JobId> {
        let batch = self.find(id).await?;
        let mut opts = DispatchOptions::new().in_batch(id);
        opts.queue = batch.options.queue.clone();
        opts.connection = batch.options.connection.clone();
        self.dispatcher.dispatch_with::<J>(data, opts).await
    }

    pub async fn find(&self, id: BatchId) -> Result<Batch> {
        self.dispatcher
            .store(None)?
            .find_batch(id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("batch {}", id)))
    }

    /// Mark the batch cancelled. Members not yet started are skipped.
    pub async fn cancel(&self, id: BatchId) -> Result<Batch> {
        let batch = self.dispatcher.store(None)?.cancel_batch(id).await?;
        tracing::info!(batch_id = %id, pending = batch.pending_jobs, "Batch cancelled");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use crate::store::memory::InMemoryStore;
    use crate::store::QueueStore;

    struct Render;

    #[async_trait]
    impl Job for Render {
        const NAME: &'static str = "render_galley";
        type Data = u32;

        async fn execute(&self, _ctx: JobContext, _data: u32) -> std::result::Result<(), JobFailure> {
            Ok(())
        }

        fn max_tries() -> Option<u32> {
            Some(2)
        }
    }

    fn coordinator() -> (InMemoryStore, BatchCoordinator) {
        let store = InMemoryStore::new();
        let dispatcher = Dispatcher::new("memory", Arc::new(store.clone()));
        (store, BatchCoordinator::new(dispatcher))
    }

    #[tokio::test]
    async fn dispatch_writes_batch_and_members_together() {
        let (store, batches) = coordinator();
        let builder = BatchBuilder::new("issue 12")
            .add::<Render>(1)
            .unwrap()
            .add::<Render>(2)
            .unwrap()
            .on_queue("galleys");

        let id = batches.dispatch(builder).await.unwrap();
        let batch = batches.find(id).await.unwrap();

        assert_eq!(batch.name, "issue 12");
        assert_eq!(batch.total_jobs, 2);
        assert_eq!(batch.pending_jobs, 2);
        assert_eq!(store.count(Some("galleys")).await.unwrap(), 2);

        let job = store
            .reserve_next("galleys", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.batch_id, Some(id));
        assert_eq!(job.max_tries, Some(2));
    }

    #[tokio::test]
    async fn add_extends_a_running_batch() {
        let (_store, batches) = coordinator();
        let id = batches
            .dispatch(BatchBuilder::new("grow").add::<Render>(1).unwrap())
            .await
            .unwrap();

        batches.add::<Render>(id, 2).await.unwrap();

        let batch = batches.find(id).await.unwrap();
        assert_eq!(batch.total_jobs, 2);
        assert_eq!(batch.pending_jobs, 2);
    }

    #[tokio::test]
    async fn add_to_finished_batch_is_rejected() {
        let (_store, batches) = coordinator();
        let id = batches.dispatch(BatchBuilder::new("empty")).await.unwrap();
        assert!(batches.find(id).await.unwrap().finished());

        let err = batches.add::<Render>(id, 1).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidBatch(_)));
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let (_store, batches) = coordinator();
        assert!(batches.find(BatchId::new()).await.unwrap_err().is_not_found());
        assert!(batches.cancel(BatchId::new()).await.unwrap_err().is_not_found());
    }
}
