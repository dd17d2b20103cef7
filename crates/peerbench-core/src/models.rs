//! Shared typed models used across storage, compute, and query layers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// Compute a stable fingerprint of a line-item subset.
///
/// SHA-256 over the sorted key tuples and values, truncated to 16 hex
/// characters. Used as a memoization key for the KPI calculator and for
/// idempotence checks on rebuilt generations.
pub fn snapshot_hash(items: &[LineItem]) -> String {
    let mut keys: Vec<String> = items
        .iter()
        .map(|it| {
            format!(
                "{}\x1f{}\x1f{}\x1f{}\x1f{}",
                it.entity_id,
                it.period,
                it.line,
                it.column,
                it.value.to_bits()
            )
        })
        .collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ---------------------------------------------------------------------------
// 1. LineItem
// ---------------------------------------------------------------------------

/// A single immutable financial line-item fact, unique per
/// `(entity_id, period, line, column)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub entity_id: String,
    pub period: i64,
    pub line: String,
    pub column: String,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// 2. EntityAttribute
// ---------------------------------------------------------------------------

/// One scope dimension value attached to an entity (e.g. `region = "EU"`).
///
/// Supplied by the same upstream batch as the line items. An entity missing
/// a dimension is simply absent from scopes that partition on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAttribute {
    pub entity_id: String,
    pub dimension: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// 3. KpiValueRow
// ---------------------------------------------------------------------------

/// A computed KPI value for one entity and period.
///
/// `None` means the source data was insufficient (or a denominator resolved
/// to exactly zero), which is distinct from a computed zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiValueRow {
    pub entity_id: String,
    pub period: i64,
    pub kpi_key: String,
    pub value: Option<f64>,
}

// ---------------------------------------------------------------------------
// 4. BenchmarkStat / BenchmarkRow
// ---------------------------------------------------------------------------

/// Percentile statistics for one peer-group partition.
///
/// Invariant: `p25 <= median <= p75` whenever `sample_count > 0`. Empty
/// partitions are never materialized; absence is meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStat {
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub mean: f64,
    pub sample_count: i64,
}

/// A persisted benchmark row: the stat plus its partition keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRow {
    pub kpi_key: String,
    pub scope_id: String,
    pub scope_key: String,
    pub period: i64,
    #[serde(flatten)]
    pub stat: BenchmarkStat,
}

// ---------------------------------------------------------------------------
// 5. ServedFrom / query responses
// ---------------------------------------------------------------------------

/// Provenance of a query response.
///
/// `Unavailable` marks an explicit no-data answer; the router never defaults
/// silently to zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    Precomputed,
    RawFallback,
    Unavailable,
}

/// Response of [`crate::query::router::QueryRouter::get_kpis`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiResponse {
    /// KPI key to value; `None` marks insufficient source data.
    pub values: BTreeMap<String, Option<f64>>,
    pub served_from: ServedFrom,
}

impl KpiResponse {
    /// Explicit no-data response.
    pub fn unavailable() -> Self {
        Self {
            values: BTreeMap::new(),
            served_from: ServedFrom::Unavailable,
        }
    }
}

/// Response of [`crate::query::router::QueryRouter::get_benchmarks`].
///
/// An absent stat means the partition had no non-null samples, or the store
/// was unavailable (see `served_from`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResponse {
    pub stat: Option<BenchmarkStat>,
    pub served_from: ServedFrom,
}

impl BenchmarkResponse {
    /// Explicit no-data response.
    pub fn unavailable() -> Self {
        Self {
            stat: None,
            served_from: ServedFrom::Unavailable,
        }
    }
}

// ---------------------------------------------------------------------------
// 6. BuildReport
// ---------------------------------------------------------------------------

/// Summary of one build pipeline run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildReport {
    pub run_id: String,
    pub generation: i64,
    pub periods: i64,
    pub entities_seen: i64,
    pub kpi_rows: i64,
    pub benchmark_rows: i64,
    pub elapsed_ms: i64,
}
