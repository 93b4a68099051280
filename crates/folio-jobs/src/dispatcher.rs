use crate::clock::{self, Clock};
use crate::config::QueueConfig;
use crate::error::{JobError, Result};
use crate::job::Job;
use crate::record::{BatchId, JobId, NewJob};
use crate::store::QueueStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_QUEUE: &str = "default";

/// Options for dispatching a job
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub queue: Option<String>,
    pub delay: Duration,
    pub connection: Option<String>,
    pub max_tries: Option<u32>,
    pub timeout: Option<Duration>,
    pub batch_id: Option<BatchId>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn max_tries(mut self, n: u32) -> Self {
        self.max_tries = Some(n);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// Serializes jobs and hands them to the store of the chosen connection.
///
/// Cheap to clone; pass it to whatever code needs to enqueue work.
#[derive(Clone)]
pub struct Dispatcher {
    connections: Arc<HashMap<String, Arc<dyn QueueStore>>>,
    default_connection: String,
    default_queue: String,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(default_connection: impl Into<String>, store: Arc<dyn QueueStore>) -> Self {
        let default_connection = default_connection.into();
        let mut connections = HashMap::new();
        connections.insert(default_connection.clone(), store);
        Self {
            connections: Arc::new(connections),
            default_connection,
            default_queue: DEFAULT_QUEUE.to_string(),
            clock: clock::system(),
        }
    }

    /// Register an additional named connection.
    pub fn with_connection(mut self, name: impl Into<String>, store: Arc<dyn QueueStore>) -> Self {
        Arc::make_mut(&mut self.connections).insert(name.into(), store);
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_defaults(self, config: &QueueConfig) -> Self {
        self.with_default_queue(config.default_queue.clone())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Resolve the store behind a connection name (`None` for the default).
    pub fn store(&self, connection: Option<&str>) -> Result<Arc<dyn QueueStore>> {
        let name = connection.unwrap_or(&self.default_connection);
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Config(format!("unknown queue connection `{}`", name)))
    }

    /// Dispatch a job to the default queue
    pub async fn dispatch<J: Job>(&self, data: J::Data) -> Result<JobId> {
        self.dispatch_with::<J>(data, DispatchOptions::default())
            .await
    }

    /// Dispatch a job with options
    pub async fn dispatch_with<J: Job>(
        &self,
        data: J::Data,
        mut opts: DispatchOptions,
    ) -> Result<JobId> {
        let payload = serde_json::to_value(data)?;
        opts.max_tries = opts.max_tries.or_else(J::max_tries);
        opts.timeout = opts.timeout.or_else(J::timeout);
        self.push(J::NAME, payload, opts).await
    }

    /// Push an already-serialized payload.
    pub async fn push(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        opts: DispatchOptions,
    ) -> Result<JobId> {
        let connection = opts
            .connection
            .clone()
            .unwrap_or_else(|| self.default_connection.clone());
        let store = self.store(Some(&connection))?;
        let job = self.build(connection, job_type, payload, &opts);
        let queue = job.queue.clone();

        let id = store.enqueue(job).await?;
        tracing::debug!(
            job_id = %id,
            job_type,
            queue = %queue,
            delay_ms = opts.delay.as_millis() as u64,
            "Job dispatched"
        );
        Ok(id)
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn build(
        &self,
        connection: String,
        job_type: &str,
        payload: serde_json::Value,
        opts: &DispatchOptions,
    ) -> NewJob {
        let now = self.now();
        NewJob {
            connection,
            queue: opts
                .queue
                .clone()
                .unwrap_or_else(|| self.default_queue.clone()),
            job_type: job_type.to_string(),
            payload,
            max_tries: opts.max_tries,
            timeout_seconds: opts.timeout.map(|t| t.as_secs().max(1)),
            batch_id: opts.batch_id,
            available_at: clock::after(now, opts.delay),
            created_at: now,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut connections: Vec<&String> = self.connections.keys().collect();
        connections.sort();
        f.debug_struct("Dispatcher")
            .field("connections", &connections)
            .field("default_connection", &self.default_connection)
            .field("default_queue", &self.default_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobFailure;
    use crate::job::JobContext;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use serde::{Serialize, Serializer};
    use std::collections::BTreeMap;

    struct Deposit;

    #[async_trait]
    impl Job for Deposit {
        const NAME: &'static str = "deposit_doi";
        type Data = BTreeMap<String, String>;

        async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> std::result::Result<(), JobFailure> {
            Ok(())
        }

        fn max_tries() -> Option<u32> {
            Some(5)
        }
    }

    #[derive(Debug, serde::Deserialize)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _s: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("holds a live connection"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Job for Broken {
        const NAME: &'static str = "broken";
        type Data = Unserializable;

        async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> std::result::Result<(), JobFailure> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn uses_job_type_defaults_and_queue_option() {
        let store = InMemoryStore::new();
        let dispatcher = Dispatcher::new("memory", Arc::new(store.clone()));

        let id = dispatcher
            .dispatch_with::<Deposit>(BTreeMap::new(), DispatchOptions::new().on_queue("deposits"))
            .await
            .unwrap();

        let record = store.peek(id).unwrap().unwrap();
        assert_eq!(record.queue, "deposits");
        assert_eq!(record.job_type, "deposit_doi");
        assert_eq!(record.max_tries, Some(5));
        assert_eq!(record.connection, "memory");
    }

    #[tokio::test]
    async fn serialization_errors_write_nothing() {
        let store = InMemoryStore::new();
        let dispatcher = Dispatcher::new("memory", Arc::new(store.clone()));

        let err = dispatcher.dispatch::<Broken>(Unserializable).await.unwrap_err();

        assert!(matches!(err, JobError::Serialization(_)));
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn routes_to_named_connection() {
        let primary = InMemoryStore::new();
        let bulk = InMemoryStore::new();
        let dispatcher = Dispatcher::new("memory", Arc::new(primary.clone()))
            .with_connection("bulk", Arc::new(bulk.clone()));

        dispatcher
            .dispatch_with::<Deposit>(BTreeMap::new(), DispatchOptions::new().on_connection("bulk"))
            .await
            .unwrap();

        assert_eq!(primary.count(None).await.unwrap(), 0);
        assert_eq!(bulk.count(None).await.unwrap(), 1);
        assert!(matches!(
            dispatcher
                .dispatch_with::<Deposit>(BTreeMap::new(), DispatchOptions::new().on_connection("sqs"))
                .await,
            Err(JobError::Config(_))
        ));
    }
}
