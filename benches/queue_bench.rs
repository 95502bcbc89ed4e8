//! Handler queue benchmarks.
//!
//! Measures dispatch cost with an installed handler and backlog drain
//! throughput, the two paths every relayed byte goes through.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bytes::Bytes;
use sprelay::queue::HandlerQueue;

fn bench_handle_with_sync_handler(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("queue_dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("sync_handler", |b| {
        let queue: HandlerQueue<Bytes, Bytes> = HandlerQueue::new();
        queue.set_sync_handler(|buf| buf).unwrap();
        let payload = Bytes::from(vec![0u8; 1200]);

        b.iter(|| {
            rt.block_on(async {
                black_box(queue.handle(payload.clone()).await.unwrap());
            })
        })
    });

    group.finish();
}

fn bench_backlog_drain(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("queue_backlog");

    for backlog in [64u64, 512, 4096] {
        group.throughput(Throughput::Elements(backlog));
        group.bench_function(format!("drain_{}", backlog), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let queue: HandlerQueue<u64, u64> = HandlerQueue::new();
                    for i in 0..backlog {
                        let _ = queue.handle(i);
                    }
                    queue.set_sync_handler(|n| n).unwrap();
                    black_box(queue.is_empty());
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_handle_with_sync_handler, bench_backlog_drain);
criterion_main!(benches);
