//! Database module for Dingo sync
//!
//! Local durable storage backing the sync core: a JSON key/value settings
//! table (the preference store) and the year plan cache table.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.busy_timeout(std::time::Duration::from_secs(5)));

        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        // journal_mode reports the resulting mode as a row
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        Self::init_schema(&conn)?;
        drop(conn);

        log::info!("Opened sync database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(conn)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for existing databases
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: Add version column to year_plan_cache if not exists
        let has_version: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('year_plan_cache') WHERE name = 'version'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_version {
            log::info!("Running migration: Adding version column to year_plan_cache");
            conn.execute(
                "ALTER TABLE year_plan_cache ADD COLUMN version INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }

        // Migration 2: Index unsynced rows (flush scans them)
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_year_plan_cache_status ON year_plan_cache(sync_status)",
            [],
        )?;

        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> DbResult<bool> {
        let deleted = self.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    // =========================================================================
    // HELPER METHODS (for the cache module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query a single optional row
    pub fn query_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        match conn.query_row(sql, params, f) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::in_memory().unwrap();

        assert_eq!(db.get_setting::<u32>("missing").unwrap(), None);

        db.set_setting("last_accessed_year", &2024).unwrap();
        assert_eq!(db.get_setting::<i32>("last_accessed_year").unwrap(), Some(2024));

        db.set_setting("last_accessed_year", &2025).unwrap();
        assert_eq!(db.get_setting::<i32>("last_accessed_year").unwrap(), Some(2025));

        assert!(db.delete_setting("last_accessed_year").unwrap());
        assert!(!db.delete_setting("last_accessed_year").unwrap());
        assert_eq!(db.get_setting::<i32>("last_accessed_year").unwrap(), None);
    }

    #[test]
    fn test_setting_type_mismatch() {
        let db = Database::in_memory().unwrap();
        db.set_setting("name", &"dingo").unwrap();

        let result = db.get_setting::<u64>("name");
        assert!(matches!(result, Err(DbError::Serialization(_))));
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dingo.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.set_setting("theme", &"dark").unwrap();
        }

        // Reopen runs schema and migrations again
        let db = Database::new(path).unwrap();
        assert_eq!(db.get_setting::<String>("theme").unwrap().as_deref(), Some("dark"));
    }

    #[test]
    fn test_query_opt() {
        let db = Database::in_memory().unwrap();
        let none: Option<i64> = db
            .query_opt("SELECT year FROM year_plan_cache WHERE year = ?1", params![1999], |row| row.get(0))
            .unwrap();
        assert!(none.is_none());
    }
}
