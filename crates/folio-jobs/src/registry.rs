//! Job registry for mapping job types to handlers
//!
//! Payloads name their job type with a stable string. The registry is the
//! only place those strings are turned back into executable handlers, so a
//! worker can only ever run job types it was built with.

use crate::job::{Job, JobHandler};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler under `J::NAME`, replacing any previous one.
    pub async fn register<J: Job>(&self, job: J) {
        let mut handlers = self.handlers.write().await;
        if handlers
            .insert(J::NAME.to_string(), Arc::new(job))
            .is_some()
        {
            tracing::warn!(job_type = J::NAME, "Replaced existing job handler");
        }
    }

    /// Look up the handler for a job type
    pub async fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    pub async fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.read().await.contains_key(job_type)
    }

    pub async fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobFailure;
    use crate::job::JobContext;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        const NAME: &'static str = "noop";
        type Data = ();

        async fn execute(&self, _ctx: JobContext, _data: ()) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_only_registered_types() {
        let registry = JobRegistry::new();
        registry.register(Noop).await;

        assert!(registry.is_registered("noop").await);
        assert!(registry.resolve("deposit_doi").await.is_none());
        assert_eq!(registry.registered_types().await, vec!["noop".to_string()]);
    }
}
