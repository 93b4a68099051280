use async_trait::async_trait;
use folio_jobs::{
    BatchBuilder, BatchCoordinator, Clock, DispatchOptions, Dispatcher, InMemoryStore, Job,
    JobContext, JobError, JobFailure, JobRepository, ManualClock, QueueSize, QueueStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LOCK: Duration = Duration::from_secs(90);

struct Notify;

#[async_trait]
impl Job for Notify {
    const NAME: &'static str = "notify_author";
    type Data = u32;

    async fn execute(&self, _ctx: JobContext, _data: u32) -> Result<(), JobFailure> {
        Ok(())
    }
}

struct Admin {
    store: InMemoryStore,
    dispatcher: Dispatcher,
    repo: JobRepository,
    clock: ManualClock,
}

fn admin() -> Admin {
    let clock = ManualClock::default();
    let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
    let dispatcher =
        Dispatcher::new("memory", Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
    let repo = JobRepository::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
    Admin {
        store,
        dispatcher,
        repo,
        clock,
    }
}

async fn push(a: &Admin, queue: &str, n: u32) {
    for i in 0..n {
        a.dispatcher
            .push("notify_author", json!({ "n": i }), DispatchOptions::new().on_queue(queue))
            .await
            .unwrap();
    }
}

/// Reserve the next job on `queue` and move it to the failed table.
async fn fail_one(a: &Admin, queue: &str) -> i64 {
    let job = a.store.reserve_next(queue, LOCK).await.unwrap().unwrap();
    a.store
        .fail_permanently(&job, "HandlerError: smtp down")
        .await
        .unwrap()
        .unwrap()
        .record
        .id
}

#[tokio::test]
async fn test_pending_jobs_are_paginated() {
    let a = admin();
    push(&a, "mail", 7).await;

    let first = a.repo.list_pending("mail", 1, 3).await.unwrap();
    assert_eq!(first.items.len(), 3);
    assert_eq!(first.total, 7);
    assert_eq!(first.last_page(), 3);
    assert_eq!(first.items[0].payload, json!({ "n": 0 }));

    let last = a.repo.list_pending("mail", 3, 3).await.unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].payload, json!({ "n": 6 }));
}

#[tokio::test]
async fn test_counts_and_queue_sizes() {
    let a = admin();
    push(&a, "mail", 3).await;
    push(&a, "deposits", 2).await;
    a.store.reserve_next("deposits", LOCK).await.unwrap();

    assert_eq!(a.repo.count(None).await.unwrap(), 5);
    assert_eq!(a.repo.count(Some("mail")).await.unwrap(), 3);
    assert_eq!(a.repo.count(Some("nothing")).await.unwrap(), 0);

    let sizes = a.repo.queues().await.unwrap();
    assert_eq!(
        sizes,
        vec![
            QueueSize {
                queue: "deposits".into(),
                pending: 1,
                reserved: 1,
            },
            QueueSize {
                queue: "mail".into(),
                pending: 3,
                reserved: 0,
            },
        ]
    );
}

#[tokio::test]
async fn test_clearing_one_queue_leaves_others() {
    let a = admin();
    push(&a, "mail", 3).await;
    push(&a, "deposits", 2).await;

    assert_eq!(a.repo.delete_from_queue("mail").await.unwrap(), 3);
    assert_eq!(a.repo.count(None).await.unwrap(), 2);
    assert_eq!(a.repo.delete_all().await.unwrap(), 2);
    assert_eq!(a.repo.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_jobs_round_trip() {
    let a = admin();
    push(&a, "mail", 2).await;
    let first = fail_one(&a, "mail").await;
    let second = fail_one(&a, "mail").await;

    assert_eq!(a.repo.count_failed().await.unwrap(), 2);
    let listed = a.repo.list_failed(1, 10).await.unwrap();
    assert_eq!(listed.items[0].id, second);

    let shown = a.repo.find_failed(first).await.unwrap();
    assert_eq!(shown.queue, "mail");
    assert_eq!(shown.exception, "HandlerError: smtp down");

    let job_id = a.repo.retry_failed(first).await.unwrap();
    let retried = a.store.peek(job_id).unwrap().unwrap();
    assert_eq!(retried.attempts, 0);
    assert_eq!(retried.payload, json!({ "n": 0 }));
    assert_eq!(retried.available_at, a.clock.now());

    a.repo.delete_failed(second).await.unwrap();
    assert_eq!(a.repo.count_failed().await.unwrap(), 0);
    assert!(a.repo.delete_failed(second).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_retry_of_missing_failed_job_changes_nothing() {
    let a = admin();
    push(&a, "mail", 1).await;
    fail_one(&a, "mail").await;

    let err = a.repo.retry_failed(999).await.unwrap_err();

    assert!(matches!(err, JobError::NotFound(_)));
    assert_eq!(a.repo.count(None).await.unwrap(), 0);
    assert_eq!(a.repo.count_failed().await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_all_requeues_oldest_first() {
    let a = admin();
    push(&a, "mail", 3).await;
    for _ in 0..3 {
        fail_one(&a, "mail").await;
    }

    let ids = a.repo.retry_all_failed().await.unwrap();

    assert_eq!(ids.len(), 3);
    assert_eq!(a.repo.count_failed().await.unwrap(), 0);
    let pending = a.repo.list_pending("mail", 1, 10).await.unwrap();
    let order: Vec<_> = pending.items.iter().map(|j| j.payload.clone()).collect();
    assert_eq!(order, vec![json!({ "n": 0 }), json!({ "n": 1 }), json!({ "n": 2 })]);
}

#[tokio::test]
async fn test_flush_failed() {
    let a = admin();
    push(&a, "mail", 2).await;
    fail_one(&a, "mail").await;
    fail_one(&a, "mail").await;

    assert_eq!(a.repo.delete_all_failed().await.unwrap(), 2);
    assert_eq!(a.repo.count_failed().await.unwrap(), 0);
}

#[tokio::test]
async fn test_prune_only_removes_old_finished_batches() {
    let a = admin();
    let batches = BatchCoordinator::new(a.dispatcher.clone());
    let old_empty = batches.dispatch(BatchBuilder::new("old")).await.unwrap();
    let old_open = batches
        .dispatch(BatchBuilder::new("open").add::<Notify>(1).unwrap())
        .await
        .unwrap();

    a.clock.advance(Duration::from_secs(48 * 3600));
    let recent = batches.dispatch(BatchBuilder::new("recent")).await.unwrap();

    let pruned = a.repo.prune_batches(Duration::from_secs(24 * 3600)).await.unwrap();

    assert_eq!(pruned, 1);
    assert!(a.repo.batch(old_empty).await.unwrap_err().is_not_found());
    assert!(a.repo.batch(old_open).await.is_ok());
    assert!(a.repo.batch(recent).await.is_ok());
    assert_eq!(a.repo.list_batches(1, 10).await.unwrap().total, 2);
}
