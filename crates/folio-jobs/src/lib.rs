//! # Folio Jobs
//!
//! Durable background jobs for the Folio publishing platform: DOI
//! deposits, galley rendering, notification mail and the rest of the work
//! that must not run inside a request.
//!
//! Application code enqueues through a [`Dispatcher`]; [`Worker`]s in any
//! number of processes reserve jobs from a shared [`QueueStore`], run the
//! handler registered for the job type in a [`JobRegistry`], and retry or
//! fail it according to its `max_tries`. Jobs can be grouped into batches
//! with completion callbacks through the [`BatchCoordinator`].
//!
//! ```rust,ignore
//! let store: Arc<dyn QueueStore> = config.connect().await?;
//! let registry = JobRegistry::new();
//! registry.register(DepositDoi::new(client)).await;
//!
//! let dispatcher = Dispatcher::new(&config.connection, store.clone());
//! dispatcher.dispatch::<DepositDoi>(DepositRequest { article_id: 42 }).await?;
//!
//! Worker::new(store, registry, config.worker_options())
//!     .run(shutdown_rx)
//!     .await;
//! ```

pub mod backoff;
pub mod batch;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod record;
pub mod registry;
pub mod repository;
pub mod store;
pub mod worker;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use batch::{BatchBuilder, BatchCallbacks, BatchCoordinator, BatchHooks};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use error::{JobError, JobFailure, Result};
pub use job::{Job, JobContext, JobHandler};
pub use record::{
    Batch, BatchId, BatchOptions, BatchUpdate, FailedJobRecord, JobId, JobRecord, NewJob, Page,
    PageRequest, QueueSize, Settled,
};
pub use registry::JobRegistry;
pub use repository::JobRepository;
pub use store::memory::InMemoryStore;
pub use store::QueueStore;
pub use worker::{JobOutcome, JobStatus, ShutdownHandle, Worker, WorkerOptions, WorkerPool};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
#[cfg(feature = "redis")]
pub use store::redis::RedisStore;
