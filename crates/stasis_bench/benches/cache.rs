//! Concurrent cache benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stasis_core::ConcurrentCache;
use std::sync::Arc;
use std::thread;

fn populated(count: u32) -> ConcurrentCache<u32, u64> {
    let cache = ConcurrentCache::new();
    for key in 0..count {
        cache.store(key, u64::from(key));
    }
    cache
}

/// Benchmark reads that hit the read-only view.
fn bench_load_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_hit");

    for count in [100u32, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let cache = populated(count);
            // promote the dirty map
            for _ in 0..=count {
                let _ = cache.load(&(count + 1));
            }
            let mut key = 0;
            b.iter(|| {
                key = (key + 1) % count;
                black_box(cache.load(black_box(&key)));
            });
        });
    }
    group.finish();
}

/// Benchmark reads that miss.
fn bench_load_miss(c: &mut Criterion) {
    c.bench_function("load_miss", |b| {
        let cache = populated(1_000);
        b.iter(|| black_box(cache.load(black_box(&5_000))));
    });
}

/// Benchmark overwrites of existing keys.
fn bench_store_existing(c: &mut Criterion) {
    c.bench_function("store_existing", |b| {
        let cache = populated(1_000);
        let mut key = 0;
        b.iter(|| {
            key = (key + 1) % 1_000;
            cache.store(black_box(key), black_box(7));
        });
    });
}

/// Benchmark inserts of new keys.
fn bench_store_new(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_new");
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("1000", |b| {
        b.iter(|| {
            let cache = ConcurrentCache::new();
            for key in 0..1_000u32 {
                cache.store(key, u64::from(key));
            }
            black_box(cache.len());
        });
    });
    group.finish();
}

/// Benchmark reads from several threads while one thread writes.
fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_reads");

    for threads in [2usize, 4, 8].iter() {
        group.throughput(Throughput::Elements((*threads * 1_000) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                let cache = Arc::new(populated(1_000));
                b.iter(|| {
                    thread::scope(|scope| {
                        for t in 0..threads {
                            let cache = &cache;
                            scope.spawn(move || {
                                for i in 0..1_000u32 {
                                    black_box(cache.load(&((i + t as u32) % 1_000)));
                                }
                            });
                        }
                        let cache = &cache;
                        scope.spawn(move || {
                            for i in 0..100u32 {
                                cache.store(i, 0);
                            }
                        });
                    });
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_load_hit,
    bench_load_miss,
    bench_store_existing,
    bench_store_new,
    bench_concurrent_reads,
);

criterion_main!(benches);
