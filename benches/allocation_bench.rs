//! Criterion micro-benchmarks for the metadata counters and the replica wire format.
//!
//! These benchmarks measure:
//! - Log index allocation on one hot partition vs. spread across partitions
//! - Consumer offset claims
//! - Encoding of replicated log commands
//!
//! Run with: `cargo bench --bench allocation_bench`

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::future::join_all;
use tokio::runtime::Runtime;

use connectify::metadata::{InMemoryMetadataStore, MetadataStore};
use connectify::replica::LogCommand;

const PARTITIONS: u32 = 64;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn store_with_topic(rt: &Runtime) -> Arc<InMemoryMetadataStore> {
    let store = Arc::new(InMemoryMetadataStore::new());
    rt.block_on(async {
        store.create_topic("bench", PARTITIONS).await.unwrap();
        store.register_consumer("c1", "bench").await.unwrap();
    });
    store
}

/// Concurrent allocations on one partition vs. one partition per task.
fn bench_log_index_allocation(c: &mut Criterion) {
    let rt = runtime();
    let store = store_with_topic(&rt);
    let mut group = c.benchmark_group("allocate_log_index");

    for tasks in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*tasks as u64));

        group.bench_with_input(BenchmarkId::new("hot_partition", tasks), tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| {
                let store = store.clone();
                async move {
                    join_all((0..tasks).map(|_| store.allocate_log_index("bench", 0))).await
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("spread", tasks), tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| {
                let store = store.clone();
                async move {
                    join_all((0..tasks).map(|i| {
                        store.allocate_log_index("bench", i as u32 % PARTITIONS)
                    }))
                    .await
                }
            });
        });
    }

    group.finish();
}

/// A claim against a fully consumed partition (the common idle-consumer path)
/// and a commit-then-claim pair.
fn bench_consumer_offset(c: &mut Criterion) {
    let rt = runtime();
    let store = store_with_topic(&rt);

    c.bench_function("consumer_offset_empty", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(store.consumer_offset("c1", "bench", 1).await.unwrap()) });
    });

    c.bench_function("commit_then_claim", |b| {
        b.to_async(&rt).iter(|| async {
            store.commit_partition_size("bench", 2).await.unwrap();
            black_box(store.consumer_offset("c1", "bench", 2).await.unwrap())
        });
    });
}

/// Encode a log command as it travels in AppendEntries.
fn bench_command_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_command_encode");

    for size in [16usize, 1_024, 65_536].iter() {
        let message = "x".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let command = LogCommand::append(black_box(42), "producer-1", &message, 0);
                bincode::serialize(&command).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_log_index_allocation,
    bench_consumer_offset,
    bench_command_encoding
);
criterion_main!(benches);
