//! Performance benchmarks for relay frame building and validation.
//!
//! A kiosk sends a handful of frames per second, so these numbers only
//! guard against accidental regressions (allocation per byte, quadratic
//! CRC, and the like).
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench frame_bench
//! ```

use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::Decoder;
use locker_core::LockerId;
use locker_protocol::crc::crc16;
use locker_protocol::{Request, Response, RtuCodec};

/// Benchmark CRC16 over a maximum-size RTU frame.
fn bench_crc16(c: &mut Criterion) {
    let data = vec![0xA5u8; 254];
    let mut group = c.benchmark_group("crc16");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("254_bytes", |b| b.iter(|| crc16(black_box(&data))));
    group.finish();
}

/// Benchmark building the ON frame for every locker on a full bus.
fn bench_encode_pulse_frames(c: &mut Criterion) {
    let lockers: Vec<LockerId> = (1..=64).map(|id| LockerId::new(id).unwrap()).collect();

    c.bench_function("encode_64_pulse_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(64 * 10);
            for locker in &lockers {
                let address = locker.address();
                Request::write_multiple_coils(address.slave, address.coil, true)
                    .encode_into(&mut buf);
            }
            black_box(buf)
        })
    });
}

/// Benchmark splitting and validating an echoed write.
fn bench_decode_and_parse(c: &mut Criterion) {
    let request = Request::write_single_coil(3, 7, true);
    let wire = request.encode();

    c.bench_function("decode_parse_echo", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            let frame = RtuCodec::new().decode(&mut buf).unwrap().unwrap();
            black_box(Response::parse(&request, &frame).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_crc16,
    bench_encode_pulse_frames,
    bench_decode_and_parse
);
criterion_main!(benches);
