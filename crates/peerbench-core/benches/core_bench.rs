//! Criterion benchmarks for peerbench-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema** — DDL init + migration overhead.
//! 2. **formula** — Parsing and repeated evaluation.
//! 3. **percentile** — Grouped aggregation at various partition sizes
//!    (the dominant cost of the build).
//! 4. **cache** — Hot-path get/put on the sharded result cache.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/peerbench-core/Cargo.toml
//! # Run only the percentile group:
//! cargo bench --manifest-path crates/peerbench-core/Cargo.toml -- percentile
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use peerbench_core::compute::formula::parse_formula;
use peerbench_core::compute::percentile::{aggregate, summarize};
use peerbench_core::query::cache::ResultCache;
use peerbench_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deterministic pseudo-random sample values (no RNG dependency needed for
/// stable benchmark inputs).
fn synthetic_samples(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = (i as f64 * 37.0 + 11.0) % 997.0;
            x / 7.0 - 40.0
        })
        .collect()
}

fn synthetic_grouped(entities: usize, groups: usize) -> Vec<(String, Option<f64>)> {
    (0..entities)
        .map(|i| {
            let key = format!("group-{}", i % groups);
            // Every 13th entity is a null that must not contribute.
            let value = if i % 13 == 0 {
                None
            } else {
                Some((i as f64 * 3.7) % 250.0)
            };
            (key, value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema/init_and_migrate", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            for stmt in SCHEMA_STATEMENTS {
                conn.execute_batch(stmt).unwrap();
            }
            migrate_schema(&conn).unwrap();
            black_box(conn)
        })
    });
}

fn bench_formula(c: &mut Criterion) {
    c.bench_function("formula/parse", |b| {
        b.iter(|| parse_formula(black_box("(ca - inventory) / (cl + 0.5 * debt)")).unwrap())
    });

    let expr = parse_formula("(ca - inventory) / (cl + 0.5 * debt)").unwrap();
    let resolved: BTreeMap<String, f64> = [
        ("ca".to_string(), 3_000_000_000.0),
        ("inventory".to_string(), 250_000_000.0),
        ("cl".to_string(), 521_000_000.0),
        ("debt".to_string(), 90_000_000.0),
    ]
    .into_iter()
    .collect();
    c.bench_function("formula/eval", |b| {
        b.iter(|| expr.eval(black_box(&resolved)))
    });
}

fn bench_percentile(c: &mut Criterion) {
    let mut group = c.benchmark_group("percentile");
    for n in [10usize, 1_000, 100_000] {
        let samples = synthetic_samples(n);
        group.bench_with_input(BenchmarkId::new("summarize", n), &samples, |b, samples| {
            b.iter(|| summarize(black_box(samples.clone())))
        });
    }
    for (entities, groups) in [(1_000usize, 10usize), (50_000, 200)] {
        let values = synthetic_grouped(entities, groups);
        group.bench_with_input(
            BenchmarkId::new("aggregate", format!("{entities}x{groups}")),
            &values,
            |b, values| b.iter(|| aggregate(black_box(values.clone()))),
        );
    }
    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let cache: ResultCache<u64> = ResultCache::new(4096, 16, Duration::from_secs(60));
    for i in 0..1_000u64 {
        cache.put(format!("key-{i}"), i);
    }
    c.bench_function("cache/get_hit", |b| {
        b.iter(|| cache.get(black_box("key-500")))
    });
    c.bench_function("cache/get_miss", |b| {
        b.iter(|| cache.get(black_box("missing-key")))
    });
    let mut counter = 0u64;
    c.bench_function("cache/put", |b| {
        b.iter(|| {
            counter = counter.wrapping_add(1);
            cache.put(format!("churn-{}", counter % 8_192), counter);
        })
    });
}

criterion_group!(
    benches,
    bench_schema_init,
    bench_formula,
    bench_percentile,
    bench_cache
);
criterion_main!(benches);
