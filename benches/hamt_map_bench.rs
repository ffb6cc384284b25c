//! Benchmark for HamtMap vs standard HashMap.
//!
//! Compares the persistent map against Rust's standard HashMap for common
//! operations, plus the whole-map operations only the persistent structure
//! offers cheaply.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use hamtrie::map::HamtMap;
use std::collections::HashMap;
use std::hint::black_box;

// =============================================================================
// insert Benchmark
// =============================================================================

fn benchmark_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("insert");

    for size in [1_000, 10_000, 100_000] {
        group.bench_with_input(
            BenchmarkId::new("HamtMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = HamtMap::new();
                    for index in 0..size {
                        map = map.insert(black_box(index), black_box(index * 2));
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("HashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = HashMap::new();
                    for index in 0..size {
                        map.insert(black_box(index), black_box(index * 2));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// get Benchmark
// =============================================================================

fn benchmark_get(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("get");

    for size in [100, 1_000, 10_000] {
        let persistent_map: HamtMap<i32, i32> =
            (0..size).map(|index| (index, index * 2)).collect();
        let standard_map: HashMap<i32, i32> = (0..size).map(|index| (index, index * 2)).collect();

        group.bench_with_input(
            BenchmarkId::new("HamtMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut sum = 0;
                    for key in 0..size {
                        if let Some(&value) = persistent_map.get(&black_box(key)) {
                            sum += value;
                        }
                    }
                    black_box(sum)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("HashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut sum = 0;
                    for key in 0..size {
                        if let Some(&value) = standard_map.get(&black_box(key)) {
                            sum += value;
                        }
                    }
                    black_box(sum)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// remove Benchmark
// =============================================================================

fn benchmark_remove(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("remove");

    for size in [1_000, 10_000] {
        let persistent_map: HamtMap<i32, i32> = (0..size).map(|index| (index, index)).collect();

        group.bench_with_input(
            BenchmarkId::new("HamtMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = persistent_map.clone();
                    for key in 0..size {
                        map = map.remove(&black_box(key));
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("HashMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map: HashMap<i32, i32> = (0..size).map(|index| (index, index)).collect();
                    for key in 0..size {
                        map.remove(&black_box(key));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// union Benchmark
// =============================================================================

fn benchmark_union(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("union");

    for size in [1_000, 10_000] {
        let left: HamtMap<i32, i32> = (0..size).map(|index| (index, index)).collect();
        let right: HamtMap<i32, i32> = (size / 2..size + size / 2)
            .map(|index| (index, index))
            .collect();

        group.bench_with_input(BenchmarkId::new("HamtMap", size), &size, |bencher, _| {
            bencher.iter(|| black_box(left.union(&right)));
        });

        group.bench_with_input(BenchmarkId::new("HashMap", size), &size, |bencher, _| {
            bencher.iter(|| {
                let mut merged: HashMap<i32, i32> =
                    (size / 2..size + size / 2).map(|index| (index, index)).collect();
                for key in 0..size {
                    merged.insert(black_box(key), black_box(key));
                }
                black_box(merged)
            });
        });
    }

    group.finish();
}

// =============================================================================
// Structural sharing Benchmark
// =============================================================================

fn benchmark_snapshot_update(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("snapshot_update");

    for size in [1_000, 10_000] {
        let persistent_map: HamtMap<i32, i32> = (0..size).map(|index| (index, index)).collect();

        // One persistent update against keeping a full copy of a HashMap.
        group.bench_with_input(BenchmarkId::new("HamtMap", size), &size, |bencher, _| {
            bencher.iter(|| black_box(persistent_map.insert(black_box(0), black_box(999))));
        });

        let standard_map: HashMap<i32, i32> = (0..size).map(|index| (index, index)).collect();
        group.bench_with_input(BenchmarkId::new("HashMap", size), &size, |bencher, _| {
            bencher.iter(|| {
                let mut copy = standard_map.clone();
                copy.insert(black_box(0), black_box(999));
                black_box(copy)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_get,
    benchmark_remove,
    benchmark_union,
    benchmark_snapshot_update
);
criterion_main!(benches);
