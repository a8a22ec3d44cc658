// Criterion benchmarks for tupledb-common framing and codecs
//
// Run benchmarks with:
//   cargo bench -p tupledb-common

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tupledb_common::transport::{Codec, RequestFrame};
use tupledb_common::{Request, Response};

fn sample_tuple(width: usize) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = (0..width)
        .map(|i| json!({"id": i, "name": format!("item_{}", i), "score": i as f64 * 1.5}))
        .collect();
    json!(fields)
}

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");

    for width in [1usize, 10, 100] {
        let frame = RequestFrame::new(1, Request::insert(512, sample_tuple(width)));
        for codec in [Codec::MessagePack, Codec::Json] {
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", codec), width),
                &frame,
                |b, frame| b.iter(|| codec.encode_request(black_box(frame))),
            );
        }
    }

    group.finish();
}

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");

    for width in [1usize, 10, 100] {
        let response = Response::success(1, sample_tuple(width));
        for codec in [Codec::MessagePack, Codec::Json] {
            let encoded = codec.encode_response(&response).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", codec), width),
                &encoded,
                |b, encoded| b.iter(|| codec.decode_response(black_box(encoded))),
            );
        }
    }

    group.finish();
}

fn bench_into_result(c: &mut Criterion) {
    let mut group = c.benchmark_group("into_result");

    let success = Response::success(1, sample_tuple(10));
    let nil_error = Response::success(1, json!([null, "not found"]));
    let header_error = Response::error(1, 33, "Procedure 'x' is not defined");

    group.bench_function("success", |b| b.iter(|| black_box(success.clone()).into_result()));
    group.bench_function("nil_error", |b| b.iter(|| black_box(nil_error.clone()).into_result()));
    group.bench_function("header_error", |b| {
        b.iter(|| black_box(header_error.clone()).into_result())
    });

    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_response, bench_into_result);
criterion_main!(benches);
