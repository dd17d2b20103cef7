//! Tiered query routing: cache, precomputed lookup, raw fallback.
//!
//! Per call: compute a cache key, return on a non-expired hit, consult the
//! capability detector for the operation's current mode, then serve via an
//! indexed point lookup (`Precomputed`), an on-the-fly computation scoped to
//! the single request (`RawFallback`), or an explicit no-data response
//! (`Unavailable`), never a silent zero. Responses carry their provenance.
//!
//! Cache keys embed the published generation, so a publish rotates the key
//! space; no-data responses are cached only with a short negative TTL so
//! newly arrived data surfaces quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::compute::{kpi, percentile};
use crate::config::Registry;
use crate::models::{BenchmarkResponse, KpiResponse, ServedFrom};
use crate::query::cache::{CacheStats, ResultCache};
use crate::query::capability::{AccessMode, CapabilityDetector, CapabilityReport};
use crate::query::guards;
use crate::store::database::Database;

// ---------------------------------------------------------------------------
// Options / call budget
// ---------------------------------------------------------------------------

/// Tunables for the serving tier.
#[derive(Clone, Debug)]
pub struct RouterOptions {
    /// Bounded timeout for one raw-fallback computation.
    pub fallback_timeout: Duration,
    /// Total capacity of each response cache.
    pub cache_capacity: usize,
    /// TTL for cached data responses.
    pub cache_ttl: Duration,
    /// Short TTL for cached no-data responses.
    pub negative_ttl: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            fallback_timeout: Duration::from_millis(guards::FALLBACK_TIMEOUT_MS),
            cache_capacity: guards::MAX_CACHE_ENTRIES,
            cache_ttl: Duration::from_secs_f64(guards::DEFAULT_TTL_SECONDS),
            negative_ttl: Duration::from_secs_f64(guards::NEGATIVE_TTL_SECONDS),
        }
    }
}

/// Deadline plus optional cancellation flag for one raw-fallback call.
///
/// Checked at major stage boundaries (per-entity aggregate resolution,
/// before the percentile sort) so an abandoned or slow call stops doing
/// work instead of stalling unrelated requests.
#[derive(Clone, Debug)]
pub struct CallBudget {
    deadline: Instant,
    cancel: Option<Arc<AtomicBool>>,
}

impl CallBudget {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: None,
        }
    }

    /// Budget that can additionally be cancelled by the caller.
    pub fn with_cancel(timeout: Duration, cancel: Arc<AtomicBool>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: Some(cancel),
        }
    }

    pub fn expired(&self) -> bool {
        if Instant::now() >= self.deadline {
            return true;
        }
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// QueryRouter
// ---------------------------------------------------------------------------

/// The per-request entry point of the serving tier.
///
/// Constructed once at startup from an explicit database handle and
/// registry, then shared by reference across request threads; there are no
/// hidden singletons.
pub struct QueryRouter {
    db: Database,
    registry: Arc<Registry>,
    detector: CapabilityDetector,
    opts: RouterOptions,
    kpi_cache: ResultCache<KpiResponse>,
    bench_cache: ResultCache<BenchmarkResponse>,
}

impl QueryRouter {
    pub fn new(db: Database, registry: Arc<Registry>, opts: RouterOptions) -> Self {
        let detector = CapabilityDetector::new(&db);
        let kpi_cache = ResultCache::new(opts.cache_capacity, guards::CACHE_SHARDS, opts.cache_ttl);
        let bench_cache =
            ResultCache::new(opts.cache_capacity, guards::CACHE_SHARDS, opts.cache_ttl);
        Self {
            db,
            registry,
            detector,
            opts,
            kpi_cache,
            bench_cache,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current capability state without re-probing.
    pub fn capabilities(&self) -> CapabilityReport {
        self.detector.current()
    }

    /// Re-probe capabilities; a generation change wholesale-invalidates
    /// both response caches.
    pub fn refresh_capabilities(&self) -> CapabilityReport {
        let before = self.detector.current();
        let after = self.detector.refresh(&self.db);
        if before.generation != after.generation {
            self.kpi_cache.invalidate_all();
            self.bench_cache.invalidate_all();
        }
        after
    }

    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.kpi_cache.stats(), self.bench_cache.stats())
    }

    // -----------------------------------------------------------------------
    // getKpis
    // -----------------------------------------------------------------------

    /// All KPI values for one entity and period.
    pub fn get_kpis(&self, entity_id: &str, period: i64) -> KpiResponse {
        self.get_kpis_with(entity_id, period, &CallBudget::new(self.opts.fallback_timeout))
    }

    /// As [`Self::get_kpis`], under a caller-supplied budget.
    pub fn get_kpis_with(&self, entity_id: &str, period: i64, budget: &CallBudget) -> KpiResponse {
        let report = self.detector.current();
        let key = kpi_cache_key(report.kpi_values, report.generation, entity_id, period);
        if let Some(hit) = self.kpi_cache.get(&key) {
            return hit;
        }

        let response = match report.kpi_values {
            AccessMode::Precomputed => {
                let generation = report.generation.unwrap_or(0);
                match self.db.kpi_values_for(generation, entity_id, period) {
                    Ok(values) => KpiResponse {
                        values,
                        served_from: ServedFrom::Precomputed,
                    },
                    Err(e) => {
                        warn!(entity_id, period, error = %e, "precomputed KPI lookup failed");
                        let report = self.detector.note_failure(&self.db, "kpi_values lookup");
                        match report.kpi_values {
                            AccessMode::RawFallback => {
                                self.fallback_kpis(entity_id, period, budget)
                            }
                            _ => KpiResponse::unavailable(),
                        }
                    }
                }
            }
            AccessMode::RawFallback => self.fallback_kpis(entity_id, period, budget),
            AccessMode::Unavailable => KpiResponse::unavailable(),
        };

        let ttl = self.kpi_ttl(&response);
        self.kpi_cache.put_with_ttl(key, response.clone(), ttl);
        response
    }

    /// No-data and all-null fallback responses get the short negative TTL;
    /// everything else keeps the standard TTL.
    fn kpi_ttl(&self, response: &KpiResponse) -> Duration {
        match response.served_from {
            ServedFrom::Unavailable => self.opts.negative_ttl,
            ServedFrom::RawFallback
                if response.values.is_empty()
                    || response.values.values().all(Option::is_none) =>
            {
                self.opts.negative_ttl
            }
            _ => self.opts.cache_ttl,
        }
    }

    /// Compute every configured KPI for the request from raw line items.
    fn fallback_kpis(&self, entity_id: &str, period: i64, budget: &CallBudget) -> KpiResponse {
        if budget.expired() {
            return KpiResponse::unavailable();
        }
        let items = match self.db.line_items_for(entity_id, period) {
            Ok(items) => items,
            Err(e) => {
                warn!(entity_id, period, error = %e, "raw line-item read failed");
                self.detector.note_failure(&self.db, "line_items read");
                return KpiResponse::unavailable();
            }
        };

        let mut values = std::collections::BTreeMap::new();
        for def in self.registry.kpis.values() {
            // Stage boundary: aggregate resolution per KPI.
            if budget.expired() {
                return KpiResponse::unavailable();
            }
            let value = match kpi::compute(entity_id, period, def, &items) {
                Ok(v) => v,
                Err(kpi::KpiError::InsufficientData(_)) => None,
            };
            values.insert(def.key.clone(), value);
        }
        KpiResponse {
            values,
            served_from: ServedFrom::RawFallback,
        }
    }

    // -----------------------------------------------------------------------
    // getBenchmarks
    // -----------------------------------------------------------------------

    /// One benchmark partition, or an explicit absence.
    pub fn get_benchmarks(
        &self,
        kpi_key: &str,
        scope_id: &str,
        scope_key: &str,
        period: i64,
    ) -> BenchmarkResponse {
        self.get_benchmarks_with(
            kpi_key,
            scope_id,
            scope_key,
            period,
            &CallBudget::new(self.opts.fallback_timeout),
        )
    }

    /// As [`Self::get_benchmarks`], under a caller-supplied budget.
    pub fn get_benchmarks_with(
        &self,
        kpi_key: &str,
        scope_id: &str,
        scope_key: &str,
        period: i64,
        budget: &CallBudget,
    ) -> BenchmarkResponse {
        let report = self.detector.current();
        let key = bench_cache_key(
            report.benchmarks,
            report.generation,
            kpi_key,
            scope_id,
            scope_key,
            period,
        );
        if let Some(hit) = self.bench_cache.get(&key) {
            return hit;
        }

        let response = match report.benchmarks {
            AccessMode::Precomputed => {
                let generation = report.generation.unwrap_or(0);
                match self
                    .db
                    .benchmark_stat_for(generation, kpi_key, scope_id, scope_key, period)
                {
                    Ok(stat) => BenchmarkResponse {
                        stat,
                        served_from: ServedFrom::Precomputed,
                    },
                    Err(e) => {
                        warn!(kpi_key, scope_id, scope_key, period, error = %e,
                              "precomputed benchmark lookup failed");
                        let report = self.detector.note_failure(&self.db, "benchmark lookup");
                        match report.benchmarks {
                            AccessMode::RawFallback => self.fallback_benchmarks(
                                kpi_key, scope_id, scope_key, period, budget,
                            ),
                            _ => BenchmarkResponse::unavailable(),
                        }
                    }
                }
            }
            AccessMode::RawFallback => {
                self.fallback_benchmarks(kpi_key, scope_id, scope_key, period, budget)
            }
            AccessMode::Unavailable => BenchmarkResponse::unavailable(),
        };

        let ttl = self.bench_ttl(&response);
        self.bench_cache.put_with_ttl(key, response.clone(), ttl);
        response
    }

    /// In precomputed mode an absent row is a meaningful, stable fact for
    /// the generation; in fallback mode absence may heal when data arrives,
    /// so it only gets the negative TTL.
    fn bench_ttl(&self, response: &BenchmarkResponse) -> Duration {
        match response.served_from {
            ServedFrom::Unavailable => self.opts.negative_ttl,
            ServedFrom::RawFallback if response.stat.is_none() => self.opts.negative_ttl,
            _ => self.opts.cache_ttl,
        }
    }

    /// Compute one benchmark partition from raw line items, scoped to the
    /// single requested `(kpi, scope, scope_key, period)`.
    fn fallback_benchmarks(
        &self,
        kpi_key: &str,
        scope_id: &str,
        scope_key: &str,
        period: i64,
        budget: &CallBudget,
    ) -> BenchmarkResponse {
        let Some(def) = self.registry.kpis.get(kpi_key) else {
            return BenchmarkResponse {
                stat: None,
                served_from: ServedFrom::RawFallback,
            };
        };
        let Some(scope) = self.registry.scopes.get(scope_id) else {
            return BenchmarkResponse {
                stat: None,
                served_from: ServedFrom::RawFallback,
            };
        };
        if budget.expired() {
            return BenchmarkResponse::unavailable();
        }

        let scope_map = match self.db.scope_keys_for(&scope.dimensions) {
            Ok(map) => map,
            Err(e) => {
                warn!(scope_id, error = %e, "scope key resolution failed");
                self.detector.note_failure(&self.db, "scope key resolution");
                return BenchmarkResponse::unavailable();
            }
        };

        let mut samples = Vec::new();
        for (entity_id, key) in &scope_map {
            if key != scope_key {
                continue;
            }
            // Stage boundary: aggregate resolution per entity.
            if budget.expired() {
                return BenchmarkResponse::unavailable();
            }
            let items = match self.db.line_items_for(entity_id, period) {
                Ok(items) => items,
                Err(e) => {
                    warn!(entity_id, period, error = %e, "raw line-item read failed");
                    self.detector.note_failure(&self.db, "line_items read");
                    return BenchmarkResponse::unavailable();
                }
            };
            if let Ok(Some(value)) = kpi::compute(entity_id, period, def, &items) {
                samples.push(value);
            }
        }

        // Stage boundary: before the percentile sort.
        if budget.expired() {
            return BenchmarkResponse::unavailable();
        }
        BenchmarkResponse {
            stat: percentile::summarize(samples),
            served_from: ServedFrom::RawFallback,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

fn mode_token(mode: AccessMode, generation: Option<i64>) -> String {
    match mode {
        AccessMode::Precomputed => format!("g{}", generation.unwrap_or(0)),
        AccessMode::RawFallback => "raw".to_string(),
        AccessMode::Unavailable => "none".to_string(),
    }
}

fn kpi_cache_key(mode: AccessMode, generation: Option<i64>, entity_id: &str, period: i64) -> String {
    format!(
        "kpis:{}:{entity_id}:{period}",
        mode_token(mode, generation)
    )
}

fn bench_cache_key(
    mode: AccessMode,
    generation: Option<i64>,
    kpi_key: &str,
    scope_id: &str,
    scope_key: &str,
    period: i64,
) -> String {
    format!(
        "bench:{}:{kpi_key}:{scope_id}:{scope_key}:{period}",
        mode_token(mode, generation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityAttribute, LineItem};
    use crate::pipeline::{build, BuildOptions};

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::from_json(
                r#"{
                    "kpis": [{
                        "key": "current_ratio",
                        "level": 1,
                        "formula": "ca / cl",
                        "unit": "ratio",
                        "higher_is_better": true,
                        "aggregates": {
                            "ca": {"line": "CA", "column": "TOTAL"},
                            "cl": {"line": "CL", "column": "TOTAL"}
                        }
                    }],
                    "scopes": [
                        {"id": "all", "dimensions": []},
                        {"id": "by_region", "dimensions": ["region"]}
                    ]
                }"#,
            )
            .unwrap(),
        )
    }

    fn item(entity: &str, period: i64, line: &str, value: f64) -> LineItem {
        LineItem {
            entity_id: entity.to_string(),
            period,
            line: line.to_string(),
            column: "TOTAL".to_string(),
            value,
        }
    }

    fn attr(entity: &str, dimension: &str, value: &str) -> EntityAttribute {
        EntityAttribute {
            entity_id: entity.to_string(),
            dimension: dimension.to_string(),
            value: value.to_string(),
        }
    }

    fn seed(db: &Database) {
        db.replace_line_items(
            &[
                item("310001", 2024, "CA", 3_000_000_000.0),
                item("310001", 2024, "CL", 521_000_000.0),
                // Lone entity in region US with a KPI value of exactly 12.5.
                item("310002", 2024, "CA", 12.5),
                item("310002", 2024, "CL", 1.0),
                // Zero denominator: null, excluded from benchmark samples.
                item("310003", 2024, "CA", 50.0),
                item("310003", 2024, "CL", 0.0),
            ],
            &[
                attr("310001", "region", "EU"),
                attr("310002", "region", "US"),
                attr("310003", "region", "ZERO"),
            ],
        )
        .unwrap();
    }

    fn fresh_db(dir: &tempfile::TempDir, name: &str) -> Database {
        let db = Database::new(dir.path().join(name)).unwrap();
        db.init_schema().unwrap();
        seed(&db);
        db
    }

    /// Router over a built store: precomputed provenance.
    fn precomputed_router(dir: &tempfile::TempDir) -> QueryRouter {
        let db = fresh_db(dir, "precomputed.sqlite3");
        build(&db, &registry(), &BuildOptions::default()).unwrap();
        QueryRouter::new(db, registry(), RouterOptions::default())
    }

    /// Router over a never-built store: raw fallback provenance.
    fn fallback_router(dir: &tempfile::TempDir) -> QueryRouter {
        let db = fresh_db(dir, "fallback.sqlite3");
        QueryRouter::new(db, registry(), RouterOptions::default())
    }

    #[test]
    fn precomputed_serves_current_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let router = precomputed_router(&dir);
        let response = router.get_kpis("310001", 2024);
        assert_eq!(response.served_from, ServedFrom::Precomputed);
        let expected = 3_000_000_000.0 / 521_000_000.0;
        assert!((response.values["current_ratio"].unwrap() - expected).abs() < 1e-6);
    }

    /// With persisted tables absent, both operations return values matching
    /// the precomputed-mode results.
    #[test]
    fn fallback_matches_precomputed() {
        let dir = tempfile::tempdir().unwrap();
        let pre = precomputed_router(&dir);
        let raw = fallback_router(&dir);

        let from_pre = pre.get_kpis("310001", 2024);
        let from_raw = raw.get_kpis("310001", 2024);
        assert_eq!(from_pre.served_from, ServedFrom::Precomputed);
        assert_eq!(from_raw.served_from, ServedFrom::RawFallback);
        assert_eq!(from_pre.values, from_raw.values);

        let bench_pre = pre.get_benchmarks("current_ratio", "by_region", "US", 2024);
        let bench_raw = raw.get_benchmarks("current_ratio", "by_region", "US", 2024);
        assert_eq!(bench_pre.served_from, ServedFrom::Precomputed);
        assert_eq!(bench_raw.served_from, ServedFrom::RawFallback);
        assert_eq!(bench_pre.stat, bench_raw.stat);
    }

    /// A single-entity scope collapses the quartiles onto its value.
    #[test]
    fn single_member_scope_collapses_quartiles() {
        let dir = tempfile::tempdir().unwrap();
        let router = precomputed_router(&dir);
        let response = router.get_benchmarks("current_ratio", "by_region", "US", 2024);
        let stat = response.stat.unwrap();
        assert_eq!(stat.p25, 12.5);
        assert_eq!(stat.median, 12.5);
        assert_eq!(stat.p75, 12.5);
        assert_eq!(stat.sample_count, 1);
    }

    /// The zero-denominator entity is null and its partition has no samples.
    #[test]
    fn null_kpi_is_excluded_from_benchmarks() {
        let dir = tempfile::tempdir().unwrap();
        for router in [precomputed_router(&dir), fallback_router(&dir)] {
            let kpis = router.get_kpis("310003", 2024);
            assert_eq!(kpis.values["current_ratio"], None);
            let bench = router.get_benchmarks("current_ratio", "by_region", "ZERO", 2024);
            assert_eq!(bench.stat, None);
        }
    }

    /// Unreachable storage yields explicit no-data responses, never zeros.
    #[test]
    fn unavailable_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let db = fresh_db(&dir, "gone.sqlite3");
        let conn = db.connect().unwrap();
        conn.execute_batch(
            "DROP TABLE line_items; DROP TABLE kpi_values; DROP TABLE benchmark_stats;",
        )
        .unwrap();
        drop(conn);

        let router = QueryRouter::new(db, registry(), RouterOptions::default());
        let kpis = router.get_kpis("310001", 2024);
        assert_eq!(kpis.served_from, ServedFrom::Unavailable);
        assert!(kpis.values.is_empty());
        let bench = router.get_benchmarks("current_ratio", "all", "all", 2024);
        assert_eq!(bench.served_from, ServedFrom::Unavailable);
        assert_eq!(bench.stat, None);
    }

    /// An expired budget turns the call into no-data for that call only,
    /// cached with the short negative TTL.
    #[test]
    fn expired_budget_is_unavailable_for_that_call() {
        let dir = tempfile::tempdir().unwrap();
        let db = fresh_db(&dir, "budget.sqlite3");
        let opts = RouterOptions {
            negative_ttl: Duration::from_millis(50),
            ..RouterOptions::default()
        };
        let router = QueryRouter::new(db, registry(), opts);

        let spent = CallBudget::new(Duration::ZERO);
        let response = router.get_kpis_with("310001", 2024, &spent);
        assert_eq!(response.served_from, ServedFrom::Unavailable);

        // A fresh call with a sane budget succeeds once the negative TTL
        // has lapsed.
        std::thread::sleep(Duration::from_millis(80));
        let response = router.get_kpis("310001", 2024);
        assert_eq!(response.served_from, ServedFrom::RawFallback);
    }

    /// A set cancellation flag stops fallback work at the next boundary.
    #[test]
    fn cancelled_budget_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let router = fallback_router(&dir);
        let flag = Arc::new(AtomicBool::new(true));
        let budget = CallBudget::with_cancel(Duration::from_secs(60), flag);
        let response =
            router.get_benchmarks_with("current_ratio", "by_region", "US", 2024, &budget);
        assert_eq!(response.served_from, ServedFrom::Unavailable);
    }

    /// A second identical call is served from the cache: deleting the
    /// backing rows between calls does not change the answer.
    #[test]
    fn repeat_call_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let router = precomputed_router(&dir);
        let first = router.get_kpis("310001", 2024);

        let conn = router.db().connect().unwrap();
        conn.execute_batch("DELETE FROM kpi_values;").unwrap();
        drop(conn);

        let second = router.get_kpis("310001", 2024);
        assert_eq!(first, second);
    }

    /// A new generation rotates cache keys and refresh invalidates wholesale.
    #[test]
    fn publish_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let router = precomputed_router(&dir);
        let _warm = router.get_kpis("310001", 2024);
        let (kpi_stats, _) = router.cache_stats();
        assert!(kpi_stats.entries > 0);

        build(router.db(), &registry(), &BuildOptions::default()).unwrap();
        let report = router.refresh_capabilities();
        assert_eq!(report.kpi_values, AccessMode::Precomputed);
        let (kpi_stats, bench_stats) = router.cache_stats();
        assert_eq!(kpi_stats.entries, 0);
        assert_eq!(bench_stats.entries, 0);
    }

    /// Unknown KPI or scope keys answer with an explicit absence.
    #[test]
    fn unknown_keys_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let router = fallback_router(&dir);
        let bench = router.get_benchmarks("no_such_kpi", "all", "all", 2024);
        assert_eq!(bench.stat, None);
        let bench = router.get_benchmarks("current_ratio", "no_such_scope", "x", 2024);
        assert_eq!(bench.stat, None);
    }

    /// Concurrent mixed queries across threads stay consistent.
    #[test]
    fn concurrent_queries_are_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(precomputed_router(&dir));
        let expected = 3_000_000_000.0 / 521_000_000.0;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = Arc::clone(&router);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let kpis = router.get_kpis("310001", 2024);
                    let value = kpis.values["current_ratio"].unwrap();
                    assert!((value - expected).abs() < 1e-6);
                    let bench = router.get_benchmarks("current_ratio", "all", "all", 2024);
                    assert_eq!(bench.stat.unwrap().sample_count, 2);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
