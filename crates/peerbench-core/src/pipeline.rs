//! Precomputation build pipeline orchestration with Rayon-based parallelism.
//!
//! Stages run strictly in order: load → kpis → benchmarks → index →
//! publish. All rows are written under a freshly allocated, unpublished
//! generation, so the run has no externally visible effect until the final
//! single-row publish. Any stage failure aborts the run and leaves the
//! previously published generation authoritative; orphan rows from aborted
//! runs are swept by the post-publish prune of the next successful build.

use std::collections::BTreeMap;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::compute::kpi;
use crate::compute::percentile;
use crate::config::Registry;
use crate::errors::{PeerbenchError, PeerbenchResult};
use crate::models::{BenchmarkRow, BuildReport, KpiValueRow, LineItem};
use crate::store::database::Database;

pub const STAGE_LOAD: &str = "load";
pub const STAGE_KPIS: &str = "kpis";
pub const STAGE_BENCHMARKS: &str = "benchmarks";
pub const STAGE_INDEX: &str = "index";
pub const STAGE_PUBLISH: &str = "publish";

/// Options for one build run.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Worker threads for the parallel stages.
    pub workers: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Tag an error with the stage it occurred in.
fn stage_err(stage: &'static str, err: PeerbenchError) -> PeerbenchError {
    match err {
        already @ PeerbenchError::Build { .. } => already,
        other => PeerbenchError::Build {
            stage,
            message: other.to_string(),
        },
    }
}

/// Run the full build pipeline and record the outcome in the audit table.
///
/// Deterministic and restartable: rerunning on unchanged inputs produces
/// identical `kpi_values`/`benchmark_stats` content modulo the generation
/// id. On failure the error names the failing stage and nothing is
/// published.
pub fn build(
    db: &Database,
    registry: &Registry,
    opts: &BuildOptions,
) -> PeerbenchResult<BuildReport> {
    let started = Instant::now();
    let generation = db.next_generation()?;
    let run_id = format!("run-{generation:06}");
    info!(run_id = %run_id, generation, "build started");

    match run_stages(db, registry, opts, generation, &run_id, started) {
        Ok(report) => {
            // Best-effort audit row: the run already published.
            if let Err(e) = db.record_build_run(
                &report.run_id,
                report.generation,
                "success",
                report.kpi_rows,
                report.benchmark_rows,
                report.elapsed_ms,
                None,
                None,
            ) {
                warn!(error = %e, "failed to record build audit row");
            }
            info!(
                run_id = %report.run_id,
                generation = report.generation,
                kpi_rows = report.kpi_rows,
                benchmark_rows = report.benchmark_rows,
                elapsed_ms = report.elapsed_ms,
                "build published"
            );
            Ok(report)
        }
        Err(err) => {
            let elapsed_ms = started.elapsed().as_millis() as i64;
            let stage = match &err {
                PeerbenchError::Build { stage, .. } => *stage,
                _ => "unknown",
            };
            // Best-effort: the audit insert must not mask the build error.
            let _ = db.record_build_run(
                &run_id,
                generation,
                "failed",
                0,
                0,
                elapsed_ms,
                Some(stage),
                Some(&err.to_string()),
            );
            Err(err)
        }
    }
}

fn run_stages(
    db: &Database,
    registry: &Registry,
    opts: &BuildOptions,
    generation: i64,
    run_id: &str,
    started: Instant,
) -> PeerbenchResult<BuildReport> {
    // -- stage: load --------------------------------------------------------
    let periods = db.periods().map_err(|e| stage_err(STAGE_LOAD, e))?;
    let mut scope_maps: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for scope in registry.scopes.values() {
        let keys = db
            .scope_keys_for(&scope.dimensions)
            .map_err(|e| stage_err(STAGE_LOAD, e))?;
        scope_maps.insert(scope.id.clone(), keys);
    }
    debug!(periods = periods.len(), scopes = scope_maps.len(), "load stage done");

    // -- stage: kpis --------------------------------------------------------
    // Parallel per entity within each period; entity order stays sorted so
    // reruns produce identical row sequences.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers.max(1))
        .build();

    let mut entities_seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let mut kpi_rows_total = 0i64;
    // Per period, the computed rows are retained in memory for the
    // benchmark stage: values grouped as (period, kpi_key) -> entity -> value.
    let mut values_by_partition: BTreeMap<(i64, String), BTreeMap<String, Option<f64>>> =
        BTreeMap::new();

    for &period in &periods {
        let items = db
            .line_items_for_period(period)
            .map_err(|e| stage_err(STAGE_KPIS, e))?;
        let mut by_entity: BTreeMap<String, Vec<LineItem>> = BTreeMap::new();
        for item in items {
            by_entity.entry(item.entity_id.clone()).or_default().push(item);
        }
        let entity_batches: Vec<(String, Vec<LineItem>)> = by_entity.into_iter().collect();

        let compute_entity = |(entity_id, items): &(String, Vec<LineItem>)| -> Vec<KpiValueRow> {
            registry
                .kpis
                .values()
                .map(|def| {
                    let value = match kpi::compute(entity_id, period, def, items) {
                        Ok(v) => v,
                        Err(kpi::KpiError::InsufficientData(_)) => None,
                    };
                    KpiValueRow {
                        entity_id: entity_id.clone(),
                        period,
                        kpi_key: def.key.clone(),
                        value,
                    }
                })
                .collect()
        };

        let rows: Vec<KpiValueRow> = match &pool {
            Ok(pool) => pool.install(|| {
                entity_batches
                    .par_iter()
                    .map(compute_entity)
                    .flatten()
                    .collect()
            }),
            // Fallback to sequential
            Err(_) => entity_batches.iter().flat_map(compute_entity).collect(),
        };

        for row in &rows {
            entities_seen.insert(row.entity_id.clone());
            values_by_partition
                .entry((period, row.kpi_key.clone()))
                .or_default()
                .insert(row.entity_id.clone(), row.value);
        }
        kpi_rows_total += rows.len() as i64;
        db.insert_kpi_values(generation, &rows)
            .map_err(|e| stage_err(STAGE_KPIS, e))?;
        debug!(period, rows = rows.len(), "kpi stage period done");
    }

    // -- stage: benchmarks --------------------------------------------------
    // Parallel per kpi × scope; each partition groups and sorts exactly once.
    let partitions: Vec<(String, String)> = registry
        .kpis
        .keys()
        .flat_map(|kpi_key| {
            registry
                .scopes
                .keys()
                .map(move |scope_id| (kpi_key.clone(), scope_id.clone()))
        })
        .collect();

    let aggregate_partition = |(kpi_key, scope_id): &(String, String)| -> Vec<BenchmarkRow> {
        let scope_map = &scope_maps[scope_id];
        let mut rows = Vec::new();
        for &period in &periods {
            let Some(entity_values) = values_by_partition.get(&(period, kpi_key.clone())) else {
                continue;
            };
            let samples = entity_values.iter().filter_map(|(entity_id, value)| {
                scope_map
                    .get(entity_id)
                    .map(|scope_key| (scope_key.clone(), *value))
            });
            for (scope_key, stat) in percentile::aggregate(samples) {
                rows.push(BenchmarkRow {
                    kpi_key: kpi_key.clone(),
                    scope_id: scope_id.clone(),
                    scope_key,
                    period,
                    stat,
                });
            }
        }
        rows
    };

    let benchmark_rows: Vec<BenchmarkRow> = match &pool {
        Ok(pool) => pool.install(|| {
            partitions
                .par_iter()
                .map(aggregate_partition)
                .flatten()
                .collect()
        }),
        Err(_) => partitions.iter().flat_map(aggregate_partition).collect(),
    };
    db.insert_benchmark_stats(generation, &benchmark_rows)
        .map_err(|e| stage_err(STAGE_BENCHMARKS, e))?;
    debug!(rows = benchmark_rows.len(), "benchmark stage done");

    // -- stage: index -------------------------------------------------------
    db.analyze().map_err(|e| stage_err(STAGE_INDEX, e))?;

    // -- stage: publish -----------------------------------------------------
    let previous = db
        .published_generation()
        .map_err(|e| stage_err(STAGE_PUBLISH, e))?;
    db.publish_generation(generation)
        .map_err(|e| stage_err(STAGE_PUBLISH, e))?;
    // Keep the freshly published and the previous generation; in-flight
    // readers of the previous one drain against live rows.
    let keep: Vec<i64> = std::iter::once(generation).chain(previous).collect();
    db.prune_generations(&keep)
        .map_err(|e| stage_err(STAGE_PUBLISH, e))?;

    Ok(BuildReport {
        run_id: run_id.to_string(),
        generation,
        periods: periods.len() as i64,
        entities_seen: entities_seen.len() as i64,
        kpi_rows: kpi_rows_total,
        benchmark_rows: benchmark_rows.len() as i64,
        elapsed_ms: started.elapsed().as_millis() as i64,
    })
}
