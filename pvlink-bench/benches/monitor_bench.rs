//! Monitor queue and request registry benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pvlink_core::{MonitorQueue, RequestRegistry};
use pvlink_types::BitSet;

fn one_bit() -> BitSet {
    let mut changed = BitSet::new();
    changed.set(0);
    changed
}

fn bench_update_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("monitor_update_drain");

    for capacity in [2, 16, 64] {
        let queue: MonitorQueue<u64> = MonitorQueue::new(capacity);
        let changed = one_bit();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &queue,
            |b, queue| {
                b.iter(|| {
                    queue.update(black_box(1), &changed);
                    let delivered = queue.take_ready().unwrap();
                    queue.release(delivered.token);
                });
            },
        );
    }

    group.finish();
}

fn bench_saturated_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("monitor_saturated_merge");
    group.throughput(Throughput::Elements(1));

    let queue: MonitorQueue<u64> = MonitorQueue::new(2);
    let changed = one_bit();
    // Saturate once; every benched update is a merge
    queue.update(0, &changed);
    queue.update(0, &changed);

    group.bench_function("merge", |b| {
        b.iter(|| queue.update(black_box(1), &changed));
    });

    group.finish();
}

fn bench_registry_open_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_open_complete");
    group.throughput(Throughput::Elements(1));

    let registry: RequestRegistry<u64> = RequestRegistry::new();

    group.bench_function("roundtrip", |b| {
        b.iter(|| {
            let id = registry.open(Box::new(|completion| {
                black_box(completion);
            }));
            registry.complete(id, 7);
        });
    });

    group.finish();
}

fn bench_registry_fail_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_fail_all");

    for pending in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(pending as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(pending),
            &pending,
            |b, &pending| {
                b.iter(|| {
                    let registry: RequestRegistry<u64> = RequestRegistry::new();
                    for _ in 0..pending {
                        registry.open(Box::new(|_| {}));
                    }
                    registry.fail_all("bench disconnect");
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_update_drain,
    bench_saturated_merge,
    bench_registry_open_complete,
    bench_registry_fail_all,
);

criterion_main!(benches);
