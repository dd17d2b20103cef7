//! SQLite schema DDL and migration framework.

use rusqlite::Connection;

use crate::errors::PeerbenchResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL statements: 7 CREATE TABLE + 4 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (7) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS line_items (
        entity_id TEXT NOT NULL,
        period INTEGER NOT NULL,
        line TEXT NOT NULL,
        col TEXT NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY(entity_id, period, line, col)
    );",
    "CREATE TABLE IF NOT EXISTS entity_attributes (
        entity_id TEXT NOT NULL,
        dimension TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY(entity_id, dimension)
    );",
    "CREATE TABLE IF NOT EXISTS kpi_values (
        generation INTEGER NOT NULL,
        entity_id TEXT NOT NULL,
        period INTEGER NOT NULL,
        kpi_key TEXT NOT NULL,
        value REAL,
        PRIMARY KEY(generation, entity_id, period, kpi_key)
    );",
    "CREATE TABLE IF NOT EXISTS benchmark_stats (
        generation INTEGER NOT NULL,
        kpi_key TEXT NOT NULL,
        scope_id TEXT NOT NULL,
        scope_key TEXT NOT NULL,
        period INTEGER NOT NULL,
        p25 REAL NOT NULL,
        median REAL NOT NULL,
        p75 REAL NOT NULL,
        mean REAL NOT NULL,
        sample_count INTEGER NOT NULL,
        PRIMARY KEY(generation, kpi_key, scope_id, scope_key, period)
    );",
    "CREATE TABLE IF NOT EXISTS build_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        generation INTEGER NOT NULL,
        status TEXT NOT NULL,
        kpi_rows INTEGER NOT NULL DEFAULT 0,
        benchmark_rows INTEGER NOT NULL DEFAULT 0,
        elapsed_ms INTEGER NOT NULL DEFAULT 0,
        error_stage TEXT,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (4) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_line_items_period ON line_items(period, entity_id);",
    "CREATE INDEX IF NOT EXISTS idx_entity_attributes_dimension
     ON entity_attributes(dimension, value);",
    "CREATE INDEX IF NOT EXISTS idx_kpi_values_kpi ON kpi_values(generation, kpi_key, period);",
    "CREATE INDEX IF NOT EXISTS idx_build_runs_created ON build_runs(created_at);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> PeerbenchResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT peerbench_migrate_step;")?;

        let step_result = (|| -> PeerbenchResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                _ => {} // future versions: no-op until migration is defined
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT peerbench_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                // Roll back just this step, then release the savepoint.
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT peerbench_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT peerbench_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `store_meta`.
/// Returns 0 when the key is absent or unparseable.
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

/// Upsert the `schema_version` key in `store_meta`.
fn set_schema_version(conn: &Connection, version: i32) -> PeerbenchResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

/// Insert one row into `migration_history` (best-effort; never fails the
/// caller).
fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> PeerbenchResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> PeerbenchResult<()> {
    // Intentionally empty -- baseline schema already created by SCHEMA_STATEMENTS.
    Ok(())
}

/// v1 -> v2: add the per-KPI lookup index on `kpi_values`.
fn migrate_to_v2(conn: &Connection) -> PeerbenchResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_kpi_values_kpi \
         ON kpi_values(generation, kpi_key, period);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that the constant array has the expected size.
    #[test]
    fn schema_statement_counts() {
        // 7 tables + 4 indexes = 11 statements
        assert_eq!(SCHEMA_STATEMENTS.len(), 11);
    }

    /// A fresh in-memory database should migrate cleanly to the current version.
    #[test]
    fn migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    /// Running migrate_schema twice is idempotent.
    #[test]
    fn migrate_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }
}
