//! Queue throughput benchmarks
//!
//! Measures the in-memory store and the worker path end to end, which is
//! the overhead every job pays on top of its own handler.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use folio_jobs::{
    BackoffPolicy, Dispatcher, InMemoryStore, Job, JobContext, JobFailure, JobRegistry,
    QueueStore, Worker, WorkerOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct Noop;

#[async_trait]
impl Job for Noop {
    const NAME: &'static str = "noop";
    type Data = serde_json::Value;

    async fn execute(&self, _ctx: JobContext, data: Self::Data) -> Result<(), JobFailure> {
        black_box(data);
        Ok(())
    }
}

fn payload() -> serde_json::Value {
    serde_json::json!({
        "article_id": 4242,
        "doi": "10.5555/folio.4242",
        "authors": ["A. Lovelace", "C. Babbage"],
    })
}

async fn filled(n: usize) -> (InMemoryStore, Dispatcher) {
    let store = InMemoryStore::new();
    let dispatcher = Dispatcher::new("memory", Arc::new(store.clone()));
    for _ in 0..n {
        dispatcher.dispatch::<Noop>(payload()).await.unwrap();
    }
    (store, dispatcher)
}

/// Benchmark dispatch into an empty and a busy queue
fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");

    for backlog in [0usize, 1_000] {
        let (_store, dispatcher) = rt.block_on(filled(backlog));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.to_async(&rt)
                .iter(|| async { dispatcher.dispatch::<Noop>(payload()).await.unwrap() })
        });
    }

    group.finish();
}

/// Benchmark reserve + complete against a queue of varying depth
fn bench_reserve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("reserve_next");
    let lock = Duration::from_secs(90);

    for depth in [10usize, 1_000] {
        let (store, dispatcher) = rt.block_on(filled(depth));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.to_async(&rt).iter(|| async {
                let job = store.reserve_next("default", lock).await.unwrap().unwrap();
                store.complete(&job).await.unwrap();
                dispatcher.dispatch::<Noop>(payload()).await.unwrap();
            })
        });
    }

    group.finish();
}

/// Benchmark one full worker cycle: reserve, decode, run, delete
fn bench_worker_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (store, dispatcher) = rt.block_on(filled(100));
    let registry = JobRegistry::new();
    rt.block_on(registry.register(Noop));
    let worker = Worker::new(
        Arc::new(store),
        registry,
        WorkerOptions {
            backoff: BackoffPolicy::none(),
            ..WorkerOptions::default()
        },
    );

    c.bench_function("worker_cycle", |b| {
        b.to_async(&rt).iter(|| async {
            dispatcher.dispatch::<Noop>(payload()).await.unwrap();
            black_box(worker.run_next().await.unwrap())
        })
    });
}

criterion_group!(benches, bench_dispatch, bench_reserve, bench_worker_cycle);
criterion_main!(benches);
