use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use playerfouls::completeness::{CompletenessPolicy, assess};
use playerfouls::config::ReconcileConfig;
use playerfouls::identity::person_name_similarity;
use playerfouls::merge::merge_source_record;
use playerfouls::pipeline::run_batch;
use playerfouls::record::{CanonicalKey, SourceRecord, parse_source_records_jsonl};
use playerfouls::store;

fn fixture(raw: &str) -> SourceRecord {
    parse_source_records_jsonl(raw)
        .into_iter()
        .next()
        .expect("fixture has a record")
        .expect("valid fixture json")
}

fn bench_jsonl_parse(c: &mut Criterion) {
    c.bench_function("jsonl_parse", |b| {
        b.iter(|| {
            let rows = parse_source_records_jsonl(black_box(MIXED_BATCH_JSONL));
            black_box(rows.len());
        })
    });
}

fn bench_three_source_merge(c: &mut Criterion) {
    let key = CanonicalKey::new("pl-bench", "mt-bench");
    let sources = [
        fixture(FBREF_JSONL),
        fixture(SOFASCORE_JSONL),
        fixture(WHOSCORED_JSONL),
    ];

    c.bench_function("three_source_merge", |b| {
        b.iter(|| {
            let mut record = None;
            for incoming in &sources {
                record = Some(merge_source_record(record, &key, black_box(incoming)).record);
            }
            black_box(record.map(|r| r.present_count()));
        })
    });
}

fn bench_assess(c: &mut Criterion) {
    let key = CanonicalKey::new("pl-bench", "mt-bench");
    let record = merge_source_record(None, &key, &fixture(FBREF_JSONL)).record;
    let policy = CompletenessPolicy::default();

    c.bench_function("completeness_assess", |b| {
        b.iter(|| {
            let report = assess(black_box(&record), &policy);
            black_box(report.score);
        })
    });
}

fn bench_name_similarity(c: &mut Criterion) {
    let names: Vec<String> = (0..200)
        .map(|i| format!("Player{} Surname{}", i % 37, i % 53))
        .collect();

    c.bench_function("name_similarity_scan", |b| {
        b.iter(|| {
            let best = names
                .iter()
                .map(|n| person_name_similarity(black_box("player12 surname12"), n))
                .fold(0.0_f64, f64::max);
            black_box(best);
        })
    });
}

fn bench_batch_ingest(c: &mut Criterion) {
    let config = ReconcileConfig::default();
    let records = vec![
        fixture(FBREF_JSONL),
        fixture(SOFASCORE_JSONL),
        fixture(WHOSCORED_JSONL),
    ];

    c.bench_function("batch_ingest_memory", |b| {
        b.iter(|| {
            let mut conn = store::open_memory_db().unwrap();
            let summary = run_batch(&mut conn, &config, black_box(&records)).unwrap();
            black_box(summary.records_written);
        })
    });
}

criterion_group!(
    perf,
    bench_jsonl_parse,
    bench_three_source_merge,
    bench_assess,
    bench_name_similarity,
    bench_batch_ingest
);
criterion_main!(perf);

static FBREF_JSONL: &str = include_str!("../tests/fixtures/messi_fbref.jsonl");
static SOFASCORE_JSONL: &str = include_str!("../tests/fixtures/messi_sofascore.jsonl");
static WHOSCORED_JSONL: &str = include_str!("../tests/fixtures/messi_whoscored.jsonl");
static MIXED_BATCH_JSONL: &str = include_str!("../tests/fixtures/mixed_batch.jsonl");
