//! End-to-end client benchmarks against an in-process echo server.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iproto_client::{Client, ConnectionConfig};
use iproto_protocol::keys::body;
use iproto_protocol::response::IdResponse;
use iproto_protocol::{
    Body, Decoder, FeatureSet, Greeting, Header, Message, RequestType, Value, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

struct TestSetup {
    _server_handle: tokio::task::JoinHandle<()>,
    client: Client,
}

/// Greets, answers `IPROTO_ID`, then echoes call arguments and answers
/// everything else with an empty body.
async fn serve(mut stream: TcpStream) {
    let greeting = Greeting {
        product: "Tarantool".to_string(),
        version: "2.11.1".to_string(),
        protocol: "Binary".to_string(),
        instance_uuid: None,
        salt: vec![0x42; 32],
    };
    if stream.write_all(&greeting.encode().unwrap()).await.is_err() {
        return;
    }

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut out = Vec::new();
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        while let Ok(Some(request)) = decoder.decode_message() {
            let body = match request.header.request_type() {
                Some(RequestType::Watch | RequestType::Unwatch) => continue,
                Some(RequestType::Id) => IdResponse {
                    version: PROTOCOL_VERSION,
                    features: FeatureSet::all(),
                    auth_type: None,
                }
                .to_body(),
                Some(RequestType::Call) => Body::new().with(
                    body::DATA,
                    request.body.get(body::TUPLE).cloned().unwrap_or(Value::Nil),
                ),
                _ => Body::new(),
            };
            let reply = Message::new(Header::new(0, request.sync()), body);
            out.extend_from_slice(&reply.encode().unwrap());
        }
        if stream.write_all(&out).await.is_err() {
            return;
        }
        out.clear();
    }
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let (addr, server_handle) = rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream));
            }
        });
        (addr, handle)
    });

    let client = Client::new(ConnectionConfig::new(addr.to_string()));
    rt.block_on(async { client.connect().await.unwrap() });

    TestSetup {
        _server_handle: server_handle,
        client,
    }
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.ping().await.unwrap()) });
    });

    group.finish();
}

fn bench_call_payload(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_call");

    for size in [100, 1000, 10000] {
        let arg = Value::from("x".repeat(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &arg, |b, arg| {
            b.to_async(&rt).iter(|| async {
                black_box(setup.client.call("echo", vec![arg.clone()]).await.unwrap())
            });
        });
    }

    group.finish();
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");

    for concurrency in [1, 10, 100] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &conc| {
                b.to_async(&rt).iter(|| {
                    let client = &setup.client;
                    async move {
                        let futures: Vec<_> = (0..conc).map(|_| client.ping()).collect();
                        black_box(futures::future::join_all(futures).await)
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ping_latency,
    bench_call_payload,
    bench_concurrent_requests,
);

criterion_main!(benches);
