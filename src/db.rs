use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "sqlite context established"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS repair_shops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            osm_id TEXT NOT NULL UNIQUE,
            osm_type TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            street_address TEXT,
            postal_code TEXT,
            city TEXT,
            country TEXT,
            country_code TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            phone TEXT,
            email TEXT,
            website TEXT,
            verified INTEGER NOT NULL DEFAULT 0 CHECK (verified IN (0, 1)),
            rating REAL,
            review_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_repair_shops_country_code
            ON repair_shops(country_code);
        CREATE INDEX IF NOT EXISTS idx_repair_shops_updated_at
            ON repair_shops(updated_at);
        "#,
    )?;

    ensure_column(connection, "repair_shops", "opening_hours TEXT")?;
    ensure_column(connection, "repair_shops", "services TEXT")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Timestamps are stored in SQLite's `DATETIME('now')` format so that text
/// comparisons against store-written defaults stay consistent.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let count: i64 = ctx
            .connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='repair_shops'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().unwrap();
        let first = bootstrap(dir.path(), "again.db").unwrap();
        drop(first);
        bootstrap(dir.path(), "again.db").unwrap();
    }

    #[test]
    fn enforces_unique_external_id() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "unique.db").unwrap();
        ctx.connection
            .execute(
                "INSERT INTO repair_shops (osm_id, osm_type, name, country_code)
                 VALUES ('node1', 'node', 'First', 'SE')",
                [],
            )
            .unwrap();
        let duplicate = ctx.connection.execute(
            "INSERT INTO repair_shops (osm_id, osm_type, name, country_code)
             VALUES ('node1', 'node', 'Second', 'SE')",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn formats_timestamps_like_sqlite() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(ts), "2024-05-01 09:30:00");
    }
}
