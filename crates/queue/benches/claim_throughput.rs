//! Claim-path benchmarks against the in-memory store.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;

use pagesmith_core::WorkerId;
use pagesmith_queue::{EnqueueOptions, InMemoryJobStore, Queue};

fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let queue = Queue::new(InMemoryJobStore::arc());

    c.bench_function("enqueue", |b| {
        b.iter(|| {
            rt.block_on(async {
                queue
                    .enqueue("bench.job", &json!({"n": 1}), EnqueueOptions::default())
                    .await
                    .unwrap()
            })
        })
    });
}

fn bench_claim_from_backlog(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let worker = WorkerId::new("bench-worker");

    c.bench_function("claim_from_1k_backlog", |b| {
        b.iter_batched(
            || {
                let queue = Queue::new(InMemoryJobStore::arc());
                rt.block_on(async {
                    for i in 0..1_000 {
                        queue
                            .enqueue(
                                "bench.job",
                                &json!({"n": i}),
                                EnqueueOptions::default().with_priority(i % 10),
                            )
                            .await
                            .unwrap();
                    }
                });
                queue
            },
            |queue| {
                rt.block_on(async {
                    queue.claim_next_job(&worker).await.unwrap().unwrap();
                })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_enqueue, bench_claim_from_backlog);
criterion_main!(benches);
