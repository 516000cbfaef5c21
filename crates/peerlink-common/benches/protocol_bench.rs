// Criterion benchmarks for peerlink-common framing and wire encoding
//
// Run benchmarks with:
//   cargo bench -p peerlink-common
//
// For detailed output with plots:
//   cargo bench -p peerlink-common -- --save-baseline main

use std::io::{Cursor, Write};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use peerlink_common::transport::{BlockReader, BlockWriter, WireReader, WireWriter};
use peerlink_common::{RemoteFailure, MethodDescriptor, TypeDescriptor};

fn bench_block_writing(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_writing");

    let small = vec![1u8; 64];
    let large = vec![1u8; 256 * 1024];

    group.bench_function("seal_small", |b| {
        b.iter(|| {
            let mut writer = BlockWriter::new(Vec::with_capacity(128));
            writer.write_all(black_box(&small)).unwrap();
            writer.seal().unwrap();
            writer.into_inner()
        });
    });

    group.bench_function("seal_large", |b| {
        b.iter(|| {
            let mut writer = BlockWriter::new(Vec::with_capacity(large.len() + 64));
            writer.write_all(black_box(&large)).unwrap();
            writer.seal().unwrap();
            writer.into_inner()
        });
    });

    group.bench_function("empty_seal", |b| {
        let mut writer = BlockWriter::new(Vec::new());
        b.iter(|| writer.seal().unwrap());
    });

    group.finish();
}

fn bench_block_reading(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_reading");

    let mut writer = BlockWriter::new(Vec::new());
    for _ in 0..100 {
        writer.write_block(&[7u8; 512]).unwrap();
    }
    let framed = writer.into_inner();

    group.bench_function("read_100_blocks", |b| {
        b.iter(|| {
            let mut reader = BlockReader::new(Cursor::new(black_box(&framed)));
            let mut total = 0;
            while let Some(block) = reader.read_block().unwrap() {
                total += block.len();
            }
            total
        });
    });

    group.finish();
}

fn bench_wire_primitives(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_primitives");

    group.bench_function("write_call_header", |b| {
        let method = MethodDescriptor::new(TypeDescriptor::new("demo.Echo"), "echo", []);
        b.iter(|| {
            let mut w = WireWriter::with_capacity(64);
            w.write_u16(2);
            w.write_u32(black_box(42));
            w.write_u32(1);
            w.write_u32(7);
            w.write_str(black_box(method.name()));
            w.into_inner()
        });
    });

    group.bench_function("read_strings", |b| {
        let mut w = WireWriter::new();
        for _ in 0..32 {
            w.write_str("peerlink.demo.Echo");
        }
        let bytes = w.into_inner();
        b.iter(|| {
            let mut r = WireReader::new(black_box(&bytes));
            while !r.is_exhausted() {
                black_box(r.read_str().unwrap());
            }
        });
    });

    group.bench_function("encode_failure", |b| {
        let failure = RemoteFailure::application("demo.Failure", "connection failed");
        b.iter(|| black_box(&failure).encode().unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_block_writing,
    bench_block_reading,
    bench_wire_primitives,
);
criterion_main!(benches);
