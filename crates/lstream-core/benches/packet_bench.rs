//! Performance benchmarks for lstream-core.
//!
//! Run with: `cargo bench -p lstream-core`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lstream_core::{Frame, Packet, StreamState};
use lstream_crypto::StreamKeys;
use lstream_transport::ledger::PacketType;

fn data_packet(payload: usize) -> Packet {
    Packet::new(
        42,
        PacketType::Prepare,
        1_000_000,
        vec![
            Frame::StreamMoney {
                stream_id: 1,
                shares: 1_000_000,
            },
            Frame::StreamData {
                stream_id: 1,
                offset: 65_536,
                data: vec![0xAA; payload],
            },
        ],
    )
}

// ============================================================================
// Codec Benchmarks
// ============================================================================

fn bench_packet_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_codec");

    for size in [64, 1024, 16_384] {
        let packet = data_packet(size);
        let encoded = packet.to_bytes();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, packet| {
            b.iter(|| black_box(packet).to_bytes())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| Packet::from_bytes(black_box(encoded)))
        });
    }

    group.finish();
}

fn bench_packet_encryption(c: &mut Criterion) {
    let keys = StreamKeys::derive(&[7u8; 32]);
    let mut group = c.benchmark_group("packet_encryption");

    for size in [64, 1024, 16_384] {
        let packet = data_packet(size);
        let encrypted = packet.encrypt(&keys, None).unwrap();

        group.throughput(Throughput::Bytes(encrypted.len() as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size), &packet, |b, packet| {
            b.iter(|| black_box(packet).encrypt(&keys, None))
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &encrypted, |b, encrypted| {
            b.iter(|| Packet::decrypt(&keys, black_box(encrypted)))
        });
    }

    group.finish();
}

// ============================================================================
// Stream Benchmarks
// ============================================================================

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_reassembly");
    let chunk = vec![0x55u8; 512];
    let chunks = 32u64;
    group.throughput(Throughput::Bytes(512 * chunks));

    group.bench_function("in_order", |b| {
        b.iter(|| {
            let mut stream = StreamState::new(1, 1 << 20);
            for i in 0..chunks {
                stream.push_incoming_data(i * 512, chunk.clone()).unwrap();
            }
            black_box(stream.read())
        })
    });

    group.bench_function("reversed", |b| {
        b.iter(|| {
            let mut stream = StreamState::new(1, 1 << 20);
            for i in (0..chunks).rev() {
                stream.push_incoming_data(i * 512, chunk.clone()).unwrap();
            }
            black_box(stream.read())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_codec,
    bench_packet_encryption,
    bench_reassembly
);
criterion_main!(benches);
