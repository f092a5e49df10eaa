//! Benchmarks for tidews hot paths
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use tidews::frame::{FrameParser, OpCode, encode_frame};
use tidews::mask::mask_inplace;
use tidews::utf8::{Utf8Validator, validate_utf8};
use tidews::{Config, WebSocketStream};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 256, 1024, 4096, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("aligned", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            b.iter(|| mask_inplace(black_box(&mut data), black_box(MASK), 0));
        });

        // Payload continuing mid-key, as after a split read
        group.bench_with_input(BenchmarkId::new("offset", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            b.iter(|| mask_inplace(black_box(&mut data), black_box(MASK), 3));
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    for size in [64, 1024, 16384] {
        let ascii = "a".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("ascii", size), &ascii, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });
    }

    for size in [64, 1024, 4096] {
        let mixed = "Hello, 世界! 🎉 ".repeat(size / 20);
        group.throughput(Throughput::Bytes(mixed.len() as u64));

        group.bench_with_input(BenchmarkId::new("mixed", mixed.len()), &mixed, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });

        // Same text fed in 7-byte pieces so code points straddle the cuts
        group.bench_with_input(
            BenchmarkId::new("streamed", mixed.len()),
            &mixed,
            |b, data| {
                b.iter(|| {
                    let mut validator = Utf8Validator::new();
                    let ok = data.as_bytes().chunks(7).all(|c| validator.write(c));
                    ok && validator.finish()
                });
            },
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    // Inline, 16-bit and 64-bit length forms
    for size in [8, 1024, 70000] {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &vec![0u8; size], true, Some(MASK));
        let header_len = buf.len() - size;
        let header = buf.split_to(header_len).freeze();

        group.bench_with_input(BenchmarkId::new("masked", size), &header, |b, data| {
            let mut parser = FrameParser::new(true);
            b.iter(|| {
                let mut buf = BytesMut::from(data.as_ref());
                parser.decode(black_box(&mut buf)).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [8, 256, 4096, 16384] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("unmasked", size), &payload, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                encode_frame(black_box(&mut buf), OpCode::Binary, black_box(data), true, None);
            });
        });

        group.bench_with_input(BenchmarkId::new("masked", size), &payload, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                encode_frame(
                    black_box(&mut buf),
                    OpCode::Binary,
                    black_box(data),
                    true,
                    Some(MASK),
                );
            });
        });
    }

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    use tidews::handshake::{generate_accept_key, generate_key};

    let mut group = c.benchmark_group("handshake");

    group.bench_function("generate_key", |b| {
        b.iter(generate_key);
    });

    group.bench_function("generate_accept_key", |b| {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        b.iter(|| generate_accept_key(black_box(key)));
    });

    group.finish();
}

/// Client write plus server read over an in-memory pipe
fn bench_session(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("session");

    for size in [64, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        let payload = vec![0x5au8; size];

        group.bench_with_input(BenchmarkId::new("round_trip", size), &payload, |b, data| {
            let (a, z) = tokio::io::duplex(1 << 20);
            let mut client = WebSocketStream::client(a, Config::untimed());
            let mut server = WebSocketStream::server(z, Config::untimed());
            let mut buf = BytesMut::with_capacity(size);

            b.iter(|| {
                rt.block_on(async {
                    buf.clear();
                    client.write(data).await.unwrap();
                    server.read(&mut buf).await.unwrap();
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mask,
    bench_utf8,
    bench_decode,
    bench_encode,
    bench_handshake,
    bench_session,
);

criterion_main!(benches);
