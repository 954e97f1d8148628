//! Benchmarks for the staging sequencer.
//!
//! Run with: cargo bench --package alopex-stage
//!
//! ## Benchmark Categories
//!
//! - **Ingest**: staging throughput for sorted and near-ordered streams,
//!   checkpoint drains included
//! - **Drain**: close + full k-way merge of a staged sequencer
//! - **Search**: filtered range queries over staged runs

use alopex_stage::{
    Cursor, Direction, PageOffset, Sample, SearchQuery, Sequencer, SequencerConfig,
    SequencerError, VecCursor,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

const STREAM_LEN: usize = 100_000;
const WINDOW: u64 = 10_000;

/// Discards offsets; only counts them.
#[derive(Default)]
struct CountingCursor {
    count: usize,
}

impl Cursor for CountingCursor {
    fn put(&mut self, _offset: PageOffset) {
        self.count += 1;
    }

    fn set_error(&mut self, _error: SequencerError) {}

    fn complete(&mut self) {}
}

fn xorshift(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Timestamps drift forward with bounded jitter, like a fleet of slightly
/// skewed producers.
fn near_ordered_stream(len: usize, jitter: u64) -> Vec<Sample> {
    let mut state = 0x5DEECE66D_u64;
    (0..len)
        .map(|i| {
            let ts = i as u64 + xorshift(&mut state) % jitter.max(1);
            Sample::new(ts, xorshift(&mut state) % 16, i as u32)
        })
        .collect()
}

/// Stages the whole stream, flushing each checkpoint token inline.
fn ingest(seq: &Sequencer, stream: &[Sample]) -> usize {
    let mut drained = 0;
    for sample in stream {
        if let Ok(token) = seq.add(*sample) {
            if token.is_held() {
                let mut sink = CountingCursor::default();
                seq.merge(&mut sink, token);
                drained += sink.count;
            }
        }
    }
    drained
}

fn bench_ingest(c: &mut Criterion) {
    let sorted = near_ordered_stream(STREAM_LEN, 1);
    let jittered = near_ordered_stream(STREAM_LEN, 500);

    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Elements(STREAM_LEN as u64));
    group.bench_function("sorted", |b| {
        b.iter_batched(
            || Sequencer::new(SequencerConfig::new(WINDOW)).unwrap(),
            |seq| black_box(ingest(&seq, &sorted)),
            BatchSize::LargeInput,
        )
    });
    group.bench_function("near_ordered", |b| {
        b.iter_batched(
            || Sequencer::new(SequencerConfig::new(WINDOW)).unwrap(),
            |seq| black_box(ingest(&seq, &jittered)),
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let stream = near_ordered_stream(STREAM_LEN, 500);

    let mut group = c.benchmark_group("drain");
    group.throughput(Throughput::Elements(STREAM_LEN as u64));
    group.bench_function("close_and_merge", |b| {
        b.iter_batched(
            || {
                let seq = Sequencer::new(SequencerConfig::new(u64::MAX)).unwrap();
                for sample in &stream {
                    seq.add(*sample).unwrap();
                }
                seq
            },
            |seq| {
                let token = seq.close().unwrap();
                let mut sink = CountingCursor::default();
                seq.merge(&mut sink, token);
                black_box(sink.count)
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let seq = Sequencer::new(SequencerConfig::new(u64::MAX)).unwrap();
    for sample in near_ordered_stream(STREAM_LEN, 500) {
        seq.add(sample).unwrap();
    }

    let mut group = c.benchmark_group("search");
    group.bench_function("range_all_params", |b| {
        let query = SearchQuery::all_params(
            STREAM_LEN as u64 / 4,
            STREAM_LEN as u64 / 2,
            Direction::Forward,
        );
        b.iter(|| {
            let mut cursor = VecCursor::new();
            seq.search(&query, &mut cursor);
            black_box(cursor.offsets.len())
        })
    });
    group.bench_function("range_single_param", |b| {
        let query = SearchQuery::for_param(
            STREAM_LEN as u64 / 4,
            STREAM_LEN as u64 / 2,
            Direction::Forward,
            3,
        );
        b.iter(|| {
            let mut cursor = VecCursor::new();
            seq.search(&query, &mut cursor);
            black_box(cursor.offsets.len())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_ingest, bench_drain, bench_search);
criterion_main!(benches);
