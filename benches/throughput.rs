//! Throughput Benchmark for FlashFwd
//!
//! This benchmark measures the forward message decoder across the three
//! message shapes and both codecs.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashfwd::protocol::{decode_message, Fields, Value};

fn record(i: u64) -> Value {
    let mut fields = Fields::new();
    fields.insert("host".to_string(), Value::from("web-01"));
    fields.insert("seq".to_string(), Value::from(i));
    fields.insert(
        "msg".to_string(),
        Value::from(Bytes::from(format!("request {} served in 3ms", i))),
    );
    Value::Map(fields)
}

fn entry(i: u64) -> Value {
    Value::Array(vec![Value::UInt(1700000000 + i), record(i)])
}

fn single_msgpack() -> Vec<u8> {
    rmp_serde::to_vec(&Value::Array(vec![
        Value::from("bench.single"),
        Value::UInt(1700000000),
        record(0),
    ]))
    .unwrap()
}

fn inline_msgpack(entries: u64) -> Vec<u8> {
    rmp_serde::to_vec(&Value::Array(vec![
        Value::from("bench.inline"),
        Value::Array((0..entries).map(entry).collect()),
    ]))
    .unwrap()
}

fn packed_msgpack(entries: u64) -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..entries {
        stream.extend_from_slice(&rmp_serde::to_vec(&entry(i)).unwrap());
    }
    rmp_serde::to_vec(&Value::Array(vec![
        Value::from("bench.packed"),
        Value::from(Bytes::from(stream)),
    ]))
    .unwrap()
}

fn inline_json(entries: u64) -> Vec<u8> {
    serde_json::to_vec(&Value::Array(vec![
        Value::from("bench.json"),
        Value::Array((0..entries).map(entry).collect()),
    ]))
    .unwrap()
}

/// Benchmark one message per shape
fn bench_shapes(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let single = single_msgpack();
    group.bench_function("single_msgpack", |b| {
        b.iter(|| black_box(decode_message(black_box(&single)).unwrap()));
    });

    let inline = inline_msgpack(100);
    group.bench_function("inline_msgpack_100", |b| {
        b.iter(|| black_box(decode_message(black_box(&inline)).unwrap()));
    });

    let packed = packed_msgpack(100);
    group.bench_function("packed_msgpack_100", |b| {
        b.iter(|| black_box(decode_message(black_box(&packed)).unwrap()));
    });

    let json = inline_json(100);
    group.bench_function("inline_json_100", |b| {
        b.iter(|| black_box(decode_message(black_box(&json)).unwrap()));
    });

    group.finish();
}

/// Benchmark draining a buffer of back-to-back messages, as a handler does
fn bench_stream(c: &mut Criterion) {
    let mut buffer = Vec::new();
    for _ in 0..1_000 {
        buffer.extend_from_slice(&single_msgpack());
    }

    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes(buffer.len() as u64));

    group.bench_function("drain_1000_single", |b| {
        b.iter(|| {
            let mut offset = 0;
            let mut entries = 0;
            while let Some((sets, consumed)) = decode_message(&buffer[offset..]).unwrap() {
                offset += consumed;
                entries += sets.len();
                if offset == buffer.len() {
                    break;
                }
            }
            black_box(entries)
        });
    });

    // A truncated message is reported incomplete
    let partial = packed_msgpack(1_000);
    let cut = &partial[..partial.len() - 1];
    group.bench_function("incomplete_packed_1000", |b| {
        b.iter(|| black_box(decode_message(black_box(cut)).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_shapes, bench_stream);

criterion_main!(benches);
