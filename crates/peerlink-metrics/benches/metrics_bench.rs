// Criterion benchmarks for peerlink-metrics
//
// Run benchmarks with:
//   cargo bench -p peerlink-metrics
//
// For detailed output with plots:
//   cargo bench -p peerlink-metrics -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use peerlink_metrics::{ConnectionStatistics, StatisticsCollector};
use std::time::Instant;

fn bench_record_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_call");

    let statistics = ConnectionStatistics::new();

    group.bench_function("single_method", |b| {
        b.iter(|| {
            statistics.record_call(black_box("Echo.echo(String)"), black_box(Instant::now()), black_box(true));
        });
    });

    let methods = ["Echo.echo(String)", "Echo.count()", "Echo.reverse(String)", "Calc.add(int, int)"];
    group.bench_function("four_methods", |b| {
        b.iter(|| {
            for method in &methods {
                statistics.record_call(black_box(method), black_box(Instant::now()), black_box(true));
            }
        });
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    let statistics = ConnectionStatistics::new();
    for i in 0..100 {
        let method = format!("Bench.method{}()", i % 10);
        statistics.record_call(&method, Instant::now(), i % 2 == 0);
    }

    group.bench_function("snapshot_10_methods", |b| {
        b.iter(|| statistics.snapshot());
    });

    group.bench_function("dump_summary_10_methods", |b| {
        b.iter(|| statistics.dump_summary());
    });

    group.finish();
}

criterion_group!(benches, bench_record_call, bench_snapshot);
criterion_main!(benches);
