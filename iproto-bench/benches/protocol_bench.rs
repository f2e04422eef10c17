//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iproto_protocol::auth::scramble;
use iproto_protocol::frame::Frame;
use iproto_protocol::keys::body;
use iproto_protocol::response::into_result;
use iproto_protocol::{Body, Decoder, Encoder, Header, Message, Request, Value};

fn create_test_request(payload_size: usize) -> Request {
    Request::call(
        "process",
        vec![
            Value::from("i-12345"),
            Value::Map(vec![(Value::from("data"), Value::from("x".repeat(payload_size)))]),
        ],
    )
}

fn create_test_reply(rows: usize) -> Message {
    let tuples = (0..rows)
        .map(|i| {
            Value::Array(vec![
                Value::from(i as u64),
                Value::from("completed"),
                Value::from(12345678u64),
            ])
        })
        .collect();
    Message::new(
        Header::new(0, 1).with_schema_version(81),
        Body::new().with(body::DATA, Value::Array(tuples)),
    )
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(Bytes::from("x".repeat(size)));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(payload);
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");

    for size in [100, 1000, 10000] {
        let request = create_test_request(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.iter(|| black_box(Encoder::encode_request(request, 1, None).unwrap()));
        });
    }

    group.finish();
}

fn bench_reply_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_decode");

    for rows in [1, 100, 1000] {
        let encoded = create_test_reply(rows).encode().unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                let message = decoder.decode_message().unwrap().unwrap();
                black_box(into_result(message).unwrap())
            });
        });
    }

    group.finish();
}

/// Many small replies arriving in one read, as under pipelining.
fn bench_pipelined_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipelined_decode");

    for count in [10, 100, 1000] {
        let mut stream = Vec::new();
        for sync in 0..count {
            let message = Message::new(Header::new(0, sync), Body::new());
            stream.extend_from_slice(&message.encode().unwrap());
        }

        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(stream);
                let mut decoded = 0;
                while let Some(message) = decoder.decode_message().unwrap() {
                    black_box(message);
                    decoded += 1;
                }
                decoded
            });
        });
    }

    group.finish();
}

fn bench_scramble(c: &mut Criterion) {
    let salt = [0x42u8; 32];
    c.bench_function("chap_sha1_scramble", |b| {
        b.iter(|| black_box(scramble(black_box(&salt), black_box("secret"))));
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_request_encode,
    bench_reply_decode,
    bench_pipelined_decode,
    bench_scramble,
);

criterion_main!(benches);
