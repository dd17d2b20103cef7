//! Capability detection for the serving tier.
//!
//! A three-state machine per query family, probed independently: the KPI
//! table can be precomputed while benchmarks still fall back to raw
//! computation. Probes run at construction, on explicit refresh, and lazily
//! after an I/O failure. Storage trouble downgrades the mode; it is never
//! fatal to the process.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::database::Database;

/// How a query family can currently be served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Persisted generation present and sane: indexed point lookups.
    Precomputed,
    /// No usable generation, but the raw line-item store is reachable:
    /// compute on the fly, scoped to the single request.
    RawFallback,
    /// Storage unreachable: explicit no-data responses.
    Unavailable,
}

/// Detection result for both query families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    pub kpi_values: AccessMode,
    pub benchmarks: AccessMode,
    /// The published generation backing any `Precomputed` mode.
    pub generation: Option<i64>,
}

impl CapabilityReport {
    fn unavailable() -> Self {
        Self {
            kpi_values: AccessMode::Unavailable,
            benchmarks: AccessMode::Unavailable,
            generation: None,
        }
    }
}

/// Holds the current capability state and re-probes it on demand.
pub struct CapabilityDetector {
    state: Mutex<CapabilityReport>,
}

impl CapabilityDetector {
    /// Probe the store once and start from that state.
    pub fn new(db: &Database) -> Self {
        Self {
            state: Mutex::new(Self::detect(db)),
        }
    }

    /// Stateless probe of the storage handle.
    ///
    /// Per family: a readable published generation whose table passes the
    /// presence/schema check yields `Precomputed`; otherwise a reachable
    /// line-item store yields `RawFallback`; otherwise `Unavailable`.
    pub fn detect(db: &Database) -> CapabilityReport {
        let generation = match db.published_generation() {
            Ok(generation) => generation,
            Err(_) => {
                // The meta table itself is unreadable; check whether raw
                // fallback is possible at all before giving up.
                return match db.probe_line_items() {
                    Ok(()) => CapabilityReport {
                        kpi_values: AccessMode::RawFallback,
                        benchmarks: AccessMode::RawFallback,
                        generation: None,
                    },
                    Err(_) => CapabilityReport::unavailable(),
                };
            }
        };

        let raw_reachable = db.probe_line_items().is_ok();
        let fallback_mode = if raw_reachable {
            AccessMode::RawFallback
        } else {
            AccessMode::Unavailable
        };

        let kpi_values = match generation {
            Some(generation)
                if db.probe_kpi_schema().is_ok()
                    && db.has_kpi_rows(generation).unwrap_or(false) =>
            {
                AccessMode::Precomputed
            }
            _ => fallback_mode,
        };
        let benchmarks = match generation {
            Some(generation)
                if db.probe_benchmark_schema().is_ok()
                    && db.has_benchmark_rows(generation).unwrap_or(false) =>
            {
                AccessMode::Precomputed
            }
            _ => fallback_mode,
        };

        CapabilityReport {
            kpi_values,
            benchmarks,
            generation,
        }
    }

    /// The current state without re-probing.
    pub fn current(&self) -> CapabilityReport {
        *self.state.lock()
    }

    /// Re-probe and store the new state, logging transitions.
    pub fn refresh(&self, db: &Database) -> CapabilityReport {
        let next = Self::detect(db);
        let mut state = self.state.lock();
        if *state != next {
            info!(
                kpi_values = ?next.kpi_values,
                benchmarks = ?next.benchmarks,
                generation = ?next.generation,
                "capability state changed"
            );
        }
        *state = next;
        next
    }

    /// Lazy downgrade path: called after an I/O failure on the serving
    /// path. Logs the failing operation and re-probes.
    pub fn note_failure(&self, db: &Database, operation: &str) -> CapabilityReport {
        warn!(operation, "storage failure on serving path, re-probing capabilities");
        self.refresh(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BenchmarkRow, BenchmarkStat, KpiValueRow, LineItem};

    fn seeded_db(dir: &tempfile::TempDir) -> Database {
        let db = Database::new(dir.path().join("store.sqlite3")).unwrap();
        db.init_schema().unwrap();
        db.replace_line_items(
            &[LineItem {
                entity_id: "e1".to_string(),
                period: 2024,
                line: "CA".to_string(),
                column: "TOTAL".to_string(),
                value: 1.0,
            }],
            &[],
        )
        .unwrap();
        db
    }

    fn kpi_row() -> KpiValueRow {
        KpiValueRow {
            entity_id: "e1".to_string(),
            period: 2024,
            kpi_key: "k".to_string(),
            value: Some(1.0),
        }
    }

    fn bench_row() -> BenchmarkRow {
        BenchmarkRow {
            kpi_key: "k".to_string(),
            scope_id: "all".to_string(),
            scope_key: "all".to_string(),
            period: 2024,
            stat: BenchmarkStat {
                p25: 1.0,
                median: 1.0,
                p75: 1.0,
                mean: 1.0,
                sample_count: 1,
            },
        }
    }

    /// No generation published yet: raw fallback for both families.
    #[test]
    fn fresh_store_is_raw_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded_db(&dir);
        let report = CapabilityDetector::detect(&db);
        assert_eq!(report.kpi_values, AccessMode::RawFallback);
        assert_eq!(report.benchmarks, AccessMode::RawFallback);
        assert_eq!(report.generation, None);
    }

    /// KPI and benchmark availability are independent.
    #[test]
    fn families_are_detected_independently() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded_db(&dir);
        let generation = db.next_generation().unwrap();
        db.insert_kpi_values(generation, &[kpi_row()]).unwrap();
        db.publish_generation(generation).unwrap();

        let report = CapabilityDetector::detect(&db);
        assert_eq!(report.kpi_values, AccessMode::Precomputed);
        assert_eq!(report.benchmarks, AccessMode::RawFallback);

        db.insert_benchmark_stats(generation, &[bench_row()]).unwrap();
        let report = CapabilityDetector::detect(&db);
        assert_eq!(report.benchmarks, AccessMode::Precomputed);
        assert_eq!(report.generation, Some(generation));
    }

    /// Dropping the raw store with no generation published leaves nothing.
    #[test]
    fn unreachable_store_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded_db(&dir);
        let conn = db.connect().unwrap();
        conn.execute_batch(
            "DROP TABLE line_items; DROP TABLE kpi_values; DROP TABLE benchmark_stats;",
        )
        .unwrap();
        drop(conn);

        let report = CapabilityDetector::detect(&db);
        assert_eq!(report.kpi_values, AccessMode::Unavailable);
        assert_eq!(report.benchmarks, AccessMode::Unavailable);
    }

    /// `RawFallback → Precomputed` once a generation lands and passes the
    /// presence check; refresh observes the transition.
    #[test]
    fn refresh_promotes_after_publish() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded_db(&dir);
        let detector = CapabilityDetector::new(&db);
        assert_eq!(detector.current().kpi_values, AccessMode::RawFallback);

        let generation = db.next_generation().unwrap();
        db.insert_kpi_values(generation, &[kpi_row()]).unwrap();
        db.insert_benchmark_stats(generation, &[bench_row()]).unwrap();
        db.publish_generation(generation).unwrap();

        let report = detector.refresh(&db);
        assert_eq!(report.kpi_values, AccessMode::Precomputed);
        assert_eq!(report.benchmarks, AccessMode::Precomputed);
        assert_eq!(detector.current(), report);
    }
}
