//! Capture/Replay Benchmarks
//!
//! ## What We Benchmark
//!
//! ### 1. Recording (`bench_record`)
//! - Bytes/second through a `RecordingWriter` into a `Vec` sink
//! - Sizes that stay in memory, and sizes that spill mostly to disk
//!
//! ### 2. Replay (`bench_replay`)
//! - Bytes/second reading a frozen recording back with `copy_all_to`
//!
//! ### 3. Member iteration (`bench_gzip_members`)
//! - Members/second walking a concatenated archive with `GzipMembers`
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench -p crawlcap-io
//! cargo bench -p crawlcap-io --bench replay_bench gzip_members
//! ```

use std::io::{self, Cursor, Write};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crawlcap_io::gzip::{gzip, GzipMembers};
use crawlcap_io::RecordingWriter;
use tempfile::TempDir;

const BUFFER_SIZE: usize = 64 * 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    let dir = TempDir::new().unwrap();

    for size in [16 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            let mut rec: RecordingWriter<io::Sink> =
                RecordingWriter::new(BUFFER_SIZE, dir.path().join("bench"));
            b.iter(|| {
                rec.open(io::sink()).unwrap();
                for chunk in data.chunks(8192) {
                    rec.write_all(chunk).unwrap();
                }
                black_box(rec.close().unwrap());
            });
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    let dir = TempDir::new().unwrap();

    for size in [16 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        let mut rec: RecordingWriter<io::Sink> =
            RecordingWriter::new(BUFFER_SIZE, dir.path().join(format!("bench-{}", size)));
        rec.open(io::sink()).unwrap();
        rec.write_all(&payload(size)).unwrap();
        rec.close().unwrap();
        let recording = rec.recording().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &recording, |b, recording| {
            b.iter(|| {
                let mut reader = recording.replay().unwrap();
                black_box(reader.copy_all_to(&mut io::sink()).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_gzip_members(c: &mut Criterion) {
    let mut group = c.benchmark_group("gzip_members");

    for count in [10u64, 100, 1000] {
        let mut archive = Vec::new();
        for i in 0..count {
            archive.extend_from_slice(&gzip(format!("record {} ", i).repeat(64).as_bytes()).unwrap());
        }

        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &archive, |b, archive| {
            b.iter(|| {
                let mut members = GzipMembers::new(Cursor::new(archive.as_slice())).unwrap();
                let mut seen = 0;
                while members.has_next().unwrap() {
                    members.next_member().unwrap();
                    members.goto_end_of_member().unwrap();
                    seen += 1;
                }
                black_box(seen);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record, bench_replay, bench_gzip_members);
criterion_main!(benches);
