//! Ring buffer hand-off benchmark
//!
//! Measures the per-message cost of the transport-to-controller and
//! controller-to-sink buffers, plus frame decoding.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use snapstream_client::audio::{ChunkedRingBuffer, TimedRingBuffer};
use snapstream_client::protocol::{Frame, OutgoingMessage};
use snapstream_client::timestamp::Timestamp;

fn bench_ring_buffers(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffers");

    group.bench_function("chunked_write_read_4k", |b| {
        let ring = ChunkedRingBuffer::new(256 * 1024);
        let data = vec![0x5Au8; 4096];

        b.iter(|| {
            ring.write(black_box(&data), Duration::ZERO).unwrap();
            let chunk = ring.get_next_chunk(Duration::ZERO).unwrap();
            black_box(chunk.len());
        });
    });

    group.bench_function("timed_write_read_4k", |b| {
        let ring = TimedRingBuffer::new(256 * 1024);
        let data = vec![0x5Au8; 4096];
        let mut out = vec![0u8; 4096];

        b.iter(|| {
            ring.write(black_box(&data), Timestamp::now(), Duration::ZERO)
                .unwrap();
            black_box(ring.read(&mut out, Duration::ZERO));
        });
    });

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let bytes = OutgoingMessage::wire_chunk(Timestamp::now(), &[0u8; 4096]).to_bytes();

    c.bench_function("wire_chunk_decode", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&bytes)).unwrap();
            black_box(frame.header.payload_size);
        });
    });
}

criterion_group!(benches, bench_ring_buffers, bench_frame_decode);
criterion_main!(benches);
