//! SQLite storage layer for peerbench.
//!
//! Every public method opens its own short-lived connection so callers never
//! manage connection lifetime; WAL mode plus a busy timeout keeps concurrent
//! readers independent of each other and of the offline build process.
//!
//! The line-item tables are read-only from the engine's perspective; the
//! upstream wholesale refresh is modeled by [`Database::replace_line_items`],
//! which the admin CLI and tests drive. Derived tables (`kpi_values`,
//! `benchmark_stats`) are generation-scoped and only ever appended under an
//! unpublished generation, then exposed by the atomic publish marker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::errors::{PeerbenchError, PeerbenchResult};
use crate::models::{BenchmarkRow, BenchmarkStat, EntityAttribute, KpiValueRow, LineItem};
use crate::store::schema;

/// Meta key holding the currently published generation.
const META_PUBLISHED_GENERATION: &str = "published_generation";
/// Meta key holding the generation allocation counter.
const META_GENERATION_SEQ: &str = "generation_seq";

const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Scope key used by the all-entities scope (empty dimension list).
pub const ALL_SCOPE_KEY: &str = "all";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// One row of the `build_runs` audit table.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildRunRow {
    pub run_id: String,
    pub generation: i64,
    pub status: String,
    pub kpi_rows: i64,
    pub benchmark_rows: i64,
    pub elapsed_ms: i64,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Handle to the peerbench SQLite store.
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Create a new `Database`. The path is expanded and parent directories
    /// are created if they do not already exist.
    pub fn new(db_path: impl Into<PathBuf>) -> PeerbenchResult<Self> {
        let raw: PathBuf = db_path.into();
        let expanded = expand_tilde(&raw.to_string_lossy());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    /// Return the resolved database path.
    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Open a new SQLite connection with `foreign_keys` and a busy timeout.
    pub fn connect(&self) -> PeerbenchResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Schema / meta
    // -----------------------------------------------------------------------

    /// Initialise the database schema: set WAL mode, create all tables and
    /// indexes, then run pending migrations.
    pub fn init_schema(&self) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    /// Get a single store_meta value by key, or `None`.
    pub fn get_meta(&self, key: &str) -> PeerbenchResult<Option<String>> {
        let conn = self.connect()?;
        Self::get_meta_on(&conn, key)
    }

    fn get_meta_on(conn: &Connection, key: &str) -> PeerbenchResult<Option<String>> {
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM store_meta WHERE key = ?1 LIMIT 1;",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert a single store_meta key/value pair.
    pub fn set_meta(&self, key: &str, value: &str) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        Self::set_meta_on(&conn, key, value)
    }

    fn set_meta_on(conn: &Connection, key: &str, value: &str) -> PeerbenchResult<()> {
        conn.execute(
            "INSERT INTO store_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generations
    // -----------------------------------------------------------------------

    /// Return the currently published generation, or `None` before the
    /// first successful build.
    pub fn published_generation(&self) -> PeerbenchResult<Option<i64>> {
        let value = self.get_meta(META_PUBLISHED_GENERATION)?;
        Ok(value.and_then(|v| v.parse::<i64>().ok()))
    }

    /// Allocate the next generation id. Monotonically increasing; aborted
    /// builds burn an id, which is harmless.
    pub fn next_generation(&self) -> PeerbenchResult<i64> {
        let conn = self.connect()?;
        let current = Self::get_meta_on(&conn, META_GENERATION_SEQ)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current.max(0) + 1;
        Self::set_meta_on(&conn, META_GENERATION_SEQ, &next.to_string())?;
        Ok(next)
    }

    /// Atomically publish a generation: a single-row upsert of the marker.
    /// Readers pick up the new generation on their next lookup.
    pub fn publish_generation(&self, generation: i64) -> PeerbenchResult<()> {
        self.set_meta(META_PUBLISHED_GENERATION, &generation.to_string())
    }

    /// Delete derived rows belonging to any generation not listed in
    /// `keep`. Sweeps both superseded generations and orphans left behind
    /// by aborted builds.
    pub fn prune_generations(&self, keep: &[i64]) -> PeerbenchResult<()> {
        if keep.is_empty() {
            return Ok(());
        }
        let placeholders: String = keep.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let params_vec: Vec<&dyn rusqlite::types::ToSql> = keep
            .iter()
            .map(|g| g as &dyn rusqlite::types::ToSql)
            .collect();
        let conn = self.connect()?;
        conn.execute(
            &format!("DELETE FROM kpi_values WHERE generation NOT IN ({placeholders});"),
            params_vec.as_slice(),
        )?;
        conn.execute(
            &format!("DELETE FROM benchmark_stats WHERE generation NOT IN ({placeholders});"),
            params_vec.as_slice(),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Line-item store (external producer boundary)
    // -----------------------------------------------------------------------

    /// Wholesale replace of the line-item store and entity attributes, in
    /// one transaction. This is the upstream batch refresh boundary; the
    /// engine itself never mutates these tables.
    pub fn replace_line_items(
        &self,
        items: &[LineItem],
        attributes: &[EntityAttribute],
    ) -> PeerbenchResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM line_items;", [])?;
        tx.execute("DELETE FROM entity_attributes;", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO line_items (entity_id, period, line, col, value) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
            )?;
            for item in items {
                stmt.execute(params![
                    item.entity_id,
                    item.period,
                    item.line,
                    item.column,
                    item.value
                ])?;
            }
            let mut attr_stmt = tx.prepare(
                "INSERT INTO entity_attributes (entity_id, dimension, value) \
                 VALUES (?1, ?2, ?3);",
            )?;
            for attr in attributes {
                attr_stmt.execute(params![attr.entity_id, attr.dimension, attr.value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All line items for one entity and period.
    pub fn line_items_for(&self, entity_id: &str, period: i64) -> PeerbenchResult<Vec<LineItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, period, line, col, value FROM line_items \
             WHERE entity_id = ?1 AND period = ?2 \
             ORDER BY line ASC, col ASC;",
        )?;
        let rows = stmt
            .query_map(params![entity_id, period], |row| {
                Ok(LineItem {
                    entity_id: row.get(0)?,
                    period: row.get(1)?,
                    line: row.get(2)?,
                    column: row.get(3)?,
                    value: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All line items for one period, ordered by entity for deterministic
    /// downstream grouping.
    pub fn line_items_for_period(&self, period: i64) -> PeerbenchResult<Vec<LineItem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, period, line, col, value FROM line_items \
             WHERE period = ?1 \
             ORDER BY entity_id ASC, line ASC, col ASC;",
        )?;
        let rows = stmt
            .query_map(params![period], |row| {
                Ok(LineItem {
                    entity_id: row.get(0)?,
                    period: row.get(1)?,
                    line: row.get(2)?,
                    column: row.get(3)?,
                    value: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct reporting periods present in the line-item store, ascending.
    pub fn periods(&self) -> PeerbenchResult<Vec<i64>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT period FROM line_items ORDER BY period ASC;")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Map each entity to its scope key for the given dimension list.
    ///
    /// The empty dimension list is the all-entities scope: every entity in
    /// the line-item store maps to the constant key. Otherwise an entity is
    /// present only when it carries a value for every dimension; the key is
    /// the attribute values joined with `|` in dimension order.
    pub fn scope_keys_for(&self, dimensions: &[String]) -> PeerbenchResult<BTreeMap<String, String>> {
        let conn = self.connect()?;

        if dimensions.is_empty() {
            let mut stmt =
                conn.prepare("SELECT DISTINCT entity_id FROM line_items ORDER BY entity_id ASC;")?;
            let entities = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(entities
                .into_iter()
                .map(|e| (e, ALL_SCOPE_KEY.to_string()))
                .collect());
        }

        let placeholders: String = dimensions.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let params_vec: Vec<&dyn rusqlite::types::ToSql> = dimensions
            .iter()
            .map(|d| d as &dyn rusqlite::types::ToSql)
            .collect();
        let sql = format!(
            "SELECT entity_id, dimension, value FROM entity_attributes \
             WHERE dimension IN ({placeholders}) \
             ORDER BY entity_id ASC;"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_vec.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut by_entity: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (entity_id, dimension, value) in rows {
            by_entity.entry(entity_id).or_default().insert(dimension, value);
        }

        // Entities missing any dimension are excluded, not errors.
        let mut keys = BTreeMap::new();
        for (entity_id, attrs) in by_entity {
            let mut parts = Vec::with_capacity(dimensions.len());
            for dim in dimensions {
                match attrs.get(dim) {
                    Some(v) => parts.push(v.as_str()),
                    None => {
                        parts.clear();
                        break;
                    }
                }
            }
            if parts.len() == dimensions.len() {
                keys.insert(entity_id, parts.join("|"));
            }
        }
        Ok(keys)
    }

    // -----------------------------------------------------------------------
    // KPI values
    // -----------------------------------------------------------------------

    /// Insert a batch of computed KPI values under an (unpublished)
    /// generation, in one transaction.
    pub fn insert_kpi_values(&self, generation: i64, rows: &[KpiValueRow]) -> PeerbenchResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO kpi_values (generation, entity_id, period, kpi_key, value) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
            )?;
            for row in rows {
                stmt.execute(params![
                    generation,
                    row.entity_id,
                    row.period,
                    row.kpi_key,
                    row.value
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Point lookup: every KPI value for one entity and period in a
    /// generation.
    pub fn kpi_values_for(
        &self,
        generation: i64,
        entity_id: &str,
        period: i64,
    ) -> PeerbenchResult<BTreeMap<String, Option<f64>>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT kpi_key, value FROM kpi_values \
             WHERE generation = ?1 AND entity_id = ?2 AND period = ?3;",
        )?;
        let rows = stmt
            .query_map(params![generation, entity_id, period], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Benchmark stats
    // -----------------------------------------------------------------------

    /// Insert a batch of benchmark stats under an (unpublished) generation.
    pub fn insert_benchmark_stats(
        &self,
        generation: i64,
        rows: &[BenchmarkRow],
    ) -> PeerbenchResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO benchmark_stats \
                 (generation, kpi_key, scope_id, scope_key, period, \
                  p25, median, p75, mean, sample_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            )?;
            for row in rows {
                stmt.execute(params![
                    generation,
                    row.kpi_key,
                    row.scope_id,
                    row.scope_key,
                    row.period,
                    row.stat.p25,
                    row.stat.median,
                    row.stat.p75,
                    row.stat.mean,
                    row.stat.sample_count
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Point lookup of one benchmark partition, or `None` when the
    /// partition had no samples (absence is meaningful).
    pub fn benchmark_stat_for(
        &self,
        generation: i64,
        kpi_key: &str,
        scope_id: &str,
        scope_key: &str,
        period: i64,
    ) -> PeerbenchResult<Option<BenchmarkStat>> {
        let conn = self.connect()?;
        let result = conn.query_row(
            "SELECT p25, median, p75, mean, sample_count FROM benchmark_stats \
             WHERE generation = ?1 AND kpi_key = ?2 AND scope_id = ?3 \
               AND scope_key = ?4 AND period = ?5 LIMIT 1;",
            params![generation, kpi_key, scope_id, scope_key, period],
            |row| {
                Ok(BenchmarkStat {
                    p25: row.get(0)?,
                    median: row.get(1)?,
                    p75: row.get(2)?,
                    mean: row.get(3)?,
                    sample_count: row.get(4)?,
                })
            },
        );
        match result {
            Ok(stat) => Ok(Some(stat)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Capability probes
    // -----------------------------------------------------------------------

    /// Presence check: does the generation have any KPI rows?
    pub fn has_kpi_rows(&self, generation: i64) -> PeerbenchResult<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kpi_values WHERE generation = ?1;",
            params![generation],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Presence check: does the generation have any benchmark rows?
    pub fn has_benchmark_rows(&self, generation: i64) -> PeerbenchResult<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM benchmark_stats WHERE generation = ?1;",
            params![generation],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Schema probe: preparing a select of the expected columns fails when
    /// the table is missing or its shape has drifted.
    pub fn probe_kpi_schema(&self) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        conn.prepare(
            "SELECT generation, entity_id, period, kpi_key, value FROM kpi_values LIMIT 0;",
        )?;
        Ok(())
    }

    /// Schema probe for the benchmark table.
    pub fn probe_benchmark_schema(&self) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        conn.prepare(
            "SELECT generation, kpi_key, scope_id, scope_key, period, \
                    p25, median, p75, mean, sample_count \
             FROM benchmark_stats LIMIT 0;",
        )?;
        Ok(())
    }

    /// Reachability probe for the raw line-item store.
    pub fn probe_line_items(&self) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        conn.prepare("SELECT entity_id, period, line, col, value FROM line_items LIMIT 0;")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Build support
    // -----------------------------------------------------------------------

    /// Refresh the query planner's statistics after bulk inserts.
    pub fn analyze(&self) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("ANALYZE;")?;
        Ok(())
    }

    /// Content fingerprint of one generation's derived tables.
    ///
    /// SHA-256 over the ordered rows of `kpi_values` and `benchmark_stats`,
    /// truncated to 16 hex characters. Two builds over unchanged inputs must
    /// produce the same fingerprint (idempotence modulo generation id).
    pub fn generation_fingerprint(&self, generation: i64) -> PeerbenchResult<String> {
        let conn = self.connect()?;
        let mut hasher = Sha256::new();

        let mut kpi_stmt = conn.prepare(
            "SELECT entity_id, period, kpi_key, value FROM kpi_values \
             WHERE generation = ?1 \
             ORDER BY entity_id ASC, period ASC, kpi_key ASC;",
        )?;
        let kpi_rows = kpi_stmt.query_map(params![generation], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })?;
        for row in kpi_rows {
            let (entity_id, period, kpi_key, value) = row?;
            let bits = value.map(f64::to_bits);
            hasher.update(format!("k\x1f{entity_id}\x1f{period}\x1f{kpi_key}\x1f{bits:?}\n"));
        }

        let mut bench_stmt = conn.prepare(
            "SELECT kpi_key, scope_id, scope_key, period, p25, median, p75, mean, sample_count \
             FROM benchmark_stats \
             WHERE generation = ?1 \
             ORDER BY kpi_key ASC, scope_id ASC, scope_key ASC, period ASC;",
        )?;
        let bench_rows = bench_stmt.query_map(params![generation], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;
        for row in bench_rows {
            let (kpi_key, scope_id, scope_key, period, p25, median, p75, mean, count) = row?;
            hasher.update(format!(
                "b\x1f{kpi_key}\x1f{scope_id}\x1f{scope_key}\x1f{period}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{count}\n",
                p25.to_bits(),
                median.to_bits(),
                p75.to_bits(),
                mean.to_bits()
            ));
        }

        let digest = format!("{:x}", hasher.finalize());
        Ok(digest[..16].to_string())
    }

    /// Record one build run in the audit table.
    #[allow(clippy::too_many_arguments)]
    pub fn record_build_run(
        &self,
        run_id: &str,
        generation: i64,
        status: &str,
        kpi_rows: i64,
        benchmark_rows: i64,
        elapsed_ms: i64,
        error_stage: Option<&str>,
        error_message: Option<&str>,
    ) -> PeerbenchResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO build_runs \
             (run_id, generation, status, kpi_rows, benchmark_rows, elapsed_ms, \
              error_stage, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                run_id,
                generation,
                status,
                kpi_rows,
                benchmark_rows,
                elapsed_ms,
                error_stage,
                error_message
            ],
        )?;
        Ok(())
    }

    /// Recent build runs, most recent first.
    pub fn recent_build_runs(&self, limit: i64) -> PeerbenchResult<Vec<BuildRunRow>> {
        let effective_limit = limit.max(1);
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, generation, status, kpi_rows, benchmark_rows, elapsed_ms, \
                    error_stage, error_message, created_at \
             FROM build_runs \
             ORDER BY id DESC \
             LIMIT ?1;",
        )?;
        let rows = stmt
            .query_map(params![effective_limit], |row| {
                Ok(BuildRunRow {
                    run_id: row.get(0)?,
                    generation: row.get(1)?,
                    status: row.get(2)?,
                    kpi_rows: row.get(3)?,
                    benchmark_rows: row.get(4)?,
                    elapsed_ms: row.get(5)?,
                    error_stage: row.get(6)?,
                    error_message: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Create a backup of the database at `destination` using the SQLite
    /// backup API. Returns the resolved path as a string.
    pub fn backup_to(&self, destination: &std::path::Path) -> PeerbenchResult<String> {
        let backup_path = expand_tilde(&destination.to_string_lossy());
        let resolved = if backup_path.is_absolute() {
            backup_path
        } else {
            std::env::current_dir()?.join(&backup_path)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, Duration::from_millis(10), None)?;
        Ok(resolved.to_string_lossy().into_owned())
    }

    /// Restore the database from a backup file.
    pub fn restore_from(&self, source: &std::path::Path) -> PeerbenchResult<()> {
        let source_path = expand_tilde(&source.to_string_lossy());
        let resolved = if source_path.is_absolute() {
            source_path
        } else {
            std::env::current_dir()?.join(&source_path)
        };
        if !resolved.exists() {
            return Err(PeerbenchError::Storage(format!(
                "backup file does not exist: {}",
                resolved.display()
            )));
        }
        let src_conn = Connection::open(&resolved)?;
        let mut dst_conn = self.connect()?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, Duration::from_millis(10), None)?;
        Ok(())
    }
}
