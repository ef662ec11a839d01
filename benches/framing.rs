//! Criterion benchmarks for the return-stream hot path.
//!
//! The reader thread demultiplexes every byte the sequencer sends, so its
//! throughput bounds the point rate of a scan.
//!
//! Key metrics:
//! - Decode throughput (bytes/sec) for clean streams of various point sizes
//! - Resync cost when the stream carries corrupted groups
//! - Cost of one point through every evaluator kind
//!
//! Run with: cargo bench --bench framing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ion_daq::evaluation::{Algorithm, EvalContext, EvaluationDefinition, ThresholdSource};
use ion_daq::pulser::framing::{Demultiplexer, RecordEncoder, GROUP_LEN};
use ion_daq::pulser::DataPacket;
use ion_daq::scan::GlobalVariables;

/// `points` packets of `shots` counts in two buckets.
fn stream(points: u32, shots: u32) -> Vec<u8> {
    let mut enc = RecordEncoder::new();
    for point in 0..points {
        let tick = u64::from(point) * 10_000;
        enc.wall_clock(tick);
        for shot in 0..shots {
            enc.counter(0, shot % 7).counter(1, 100 + shot % 3);
        }
        enc.wall_clock(tick + 9_000).point_end();
    }
    enc.final_record(0, u64::from(points) * 10_000, u64::from(points) * 10_000 + 10);
    enc.take()
}

fn decode_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("demux_decode");

    for shots in [1u32, 50, 500] {
        let bytes = stream(200, shots);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("shots", shots), &bytes, |b, bytes| {
            b.iter(|| {
                let mut demux = Demultiplexer::new();
                let packets = demux.decode(black_box(bytes));
                black_box(packets.len())
            });
        });
    }

    group.finish();
}

fn chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("demux_chunked");
    let bytes = stream(200, 50);
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    // Reader reads arrive in arbitrary sizes.
    for chunk in [64usize, 512, 4096] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut demux = Demultiplexer::new();
                let mut out = Vec::new();
                for piece in bytes.chunks(chunk) {
                    demux.push(black_box(piece), &mut out);
                }
                black_box(out.len())
            });
        });
    }

    group.finish();
}

fn resync_cost(c: &mut Criterion) {
    let mut group = c.benchmark_group("demux_resync");
    let clean = stream(200, 50);

    for every in [1_000usize, 100] {
        let mut corrupted = clean.clone();
        let mut at = GROUP_LEN + 2;
        while at < corrupted.len() {
            corrupted[at] ^= 0x10;
            at += every * GROUP_LEN;
        }
        group.throughput(Throughput::Bytes(corrupted.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("flip_every_groups", every),
            &corrupted,
            |b, bytes| {
                b.iter(|| {
                    let mut demux = Demultiplexer::new();
                    let packets = demux.decode(black_box(bytes));
                    black_box((packets.len(), demux.stats().bad_crc))
                });
            },
        );
    }

    group.finish();
}

fn evaluate_point(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let mut packet = DataPacket::default();
    packet.counts.insert(0, (0..100).map(|i| i % 5).collect());
    packet.counts.insert(1, vec![100; 100]);
    let globals = GlobalVariables::default();
    let ctx = EvalContext::new(&globals);

    let evaluations = [
        EvaluationDefinition::new("mean", 0, Algorithm::MeanCount),
        EvaluationDefinition::new(
            "threshold",
            0,
            Algorithm::Threshold {
                threshold: ThresholdSource::Fixed(2),
                invert: false,
            },
        ),
        EvaluationDefinition::new("ratio", 0, Algorithm::Ratio { reference: 1 }),
    ];
    for evaluation in &evaluations {
        group.bench_function(evaluation.name.as_str(), |b| {
            b.iter(|| black_box(evaluation.evaluate(black_box(&packet), &ctx)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    decode_throughput,
    chunked_decode,
    resync_cost,
    evaluate_point
);
criterion_main!(benches);
