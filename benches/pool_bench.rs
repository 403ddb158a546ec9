//! Benchmarks for the worker pool.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;
use taskmill::pool::{
    BackoffStrategy, HandlerRegistry, Job, JobId, NoOpHandler, PoolConfig, SleepHandler, WorkerPool,
};

fn bench_job_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_construction");
    group.bench_function("bare", |b| { b.iter(|| black_box(Job::new("bench", json!({})))); });
    group.bench_function("with_payload", |b| { b.iter(|| black_box(Job::new("bench", json!({"user": "u-123", "amount": 42, "tags": ["a", "b"]})))); });
    group.bench_function("with_retry_budget", |b| { b.iter(|| black_box(Job::new("bench", json!({})).with_max_retries(5))); });
    group.bench_function("job_id", |b| { b.iter(|| black_box(JobId::default())); });
    group.finish();
}

fn bench_backoff_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay");
    let strategies = [
        ("fixed", BackoffStrategy::Fixed { delay: Duration::from_secs(2) }),
        ("linear", BackoffStrategy::Linear { step: Duration::from_secs(1) }),
        ("quadratic", BackoffStrategy::Quadratic { unit: Duration::from_secs(1) }),
    ];
    for (label, strategy) in strategies {
        group.bench_with_input(BenchmarkId::from_parameter(label), &strategy, |b, s| { b.iter(|| black_box(s.delay_for(black_box(5)))); });
    }
    group.finish();
}

fn bench_registry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_lookup");
    let mut registry = HandlerRegistry::new();
    registry.register(NoOpHandler);
    registry.register(SleepHandler);
    group.bench_function("hit", |b| { b.iter(|| black_box(registry.get("noop").is_some())); });
    group.bench_function("miss", |b| { b.iter(|| black_box(registry.get("missing").is_some())); });
    group.finish();
}

fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = rt.block_on(async {
        let pool = WorkerPool::new(PoolConfig::default().with_workers(4).with_queue_capacity(100_000));
        pool.register_handler(NoOpHandler).unwrap();
        pool.start().unwrap();
        pool
    });
    group.bench_function("running_pool", |b| { b.iter(|| { let _ = black_box(pool.submit(Job::new("noop", json!({})))); }); });
    rt.block_on(async { pool.stop().await.unwrap(); });
    group.finish();
}

fn bench_pool_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_round_trip");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for jobs in [10, 100] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &n| {
            b.iter(|| { rt.block_on(async {
                let pool = WorkerPool::new(PoolConfig::default().with_workers(2).with_queue_capacity(n));
                pool.register_handler(NoOpHandler).unwrap();
                pool.start().unwrap();
                let mut results = pool.subscribe();
                for _ in 0..n { pool.submit(Job::new("noop", json!({}))).unwrap(); }
                for _ in 0..n { black_box(results.recv().await.unwrap()); }
                pool.stop().await.unwrap();
            }); });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_job_construction, bench_backoff_delay, bench_registry_lookup, bench_submit, bench_pool_round_trip);
criterion_main!(benches);
