// In tabulon-core/benches/chunk_bench.rs

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tabulon::chunks::{merge, split, split_by_group};
use tabulon::{Column, Schema, SchemaOptions, StorageTarget, TypeRegistry};

// --- Generated tables ---

/// A conformed table with `rows` rows spread over `groups` patients, with a
/// low-cardinality ward column so merges exercise dictionary unions.
fn generate_visits(rows: usize, groups: i64) -> RecordBatch {
    let wards = ["icu", "er", "or", "ward-a", "ward-b", "lab"];
    let patient: Int64Array = (0..rows).map(|i| Some((i as i64 * 7919) % groups)).collect();
    let ward: StringArray = (0..rows).map(|i| Some(wards[i % wards.len()])).collect();
    let score: Float64Array = (0..rows).map(|i| Some(i as f64 * 0.5)).collect();
    let raw = RecordBatch::try_from_iter(vec![
        ("patient", Arc::new(patient) as ArrayRef),
        ("ward", Arc::new(ward)),
        ("score", Arc::new(score)),
    ])
    .unwrap();
    let schema = Schema::new(
        "visits",
        vec![
            Column::identifier("patient"),
            Column::categorical("ward"),
            Column::numeric("score"),
        ],
        SchemaOptions::default(),
    )
    .unwrap();
    schema
        .conform(&raw, &StorageTarget::Default, &TypeRegistry::standard())
        .unwrap()
}

// --- Benchmark Suite ---

const BENCH_ROWS: usize = 200_000;

fn bench_chunking(c: &mut Criterion) {
    let table = generate_visits(BENCH_ROWS, 5_000);

    let mut group = c.benchmark_group("Chunk Algebra");
    group.throughput(criterion::Throughput::Elements(BENCH_ROWS as u64));

    for size in [1_000, 20_000] {
        group.bench_with_input(BenchmarkId::new("split", size), &size, |b, &size| {
            b.iter(|| black_box(split(black_box(&table), size).unwrap().count()))
        });

        group.bench_with_input(BenchmarkId::new("split_by_group", size), &size, |b, &size| {
            b.iter(|| {
                black_box(
                    split_by_group(black_box(&table), "patient", size, 40)
                        .unwrap()
                        .count(),
                )
            })
        });

        let chunks: Vec<RecordBatch> = split(&table, size).unwrap().collect();
        group.bench_with_input(BenchmarkId::new("merge", size), &chunks, |b, chunks| {
            b.iter(|| black_box(merge(black_box(chunks)).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chunking);
criterion_main!(benches);
