//! SQLite storage: connection pool, schema, and source-table access.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::features::{build_feature_schema, ALL_GROUPS};
use crate::source::{SourceId, SourceRecord, ALL_SOURCES};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_CHECKOUT_TIMEOUT_MS: u64 = 30_000;

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("invalid pool size {0}")]
    InvalidPoolSize(usize),
}

/// Bounded pool of connections to one database file.
///
/// Built once per process and handed to each component by reference. Every
/// connection gets the WAL PRAGMAs and the busy timeout when it is opened, and
/// the schema is applied before the pool is returned.
pub struct ConnectionPool {
    path: PathBuf,
    max_size: usize,
    inner: r2d2::Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    pub fn open(path: &Path, max_size: usize) -> Result<Self, StoreError> {
        Self::open_with_timeouts(
            path,
            max_size,
            Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            Duration::from_millis(DEFAULT_CHECKOUT_TIMEOUT_MS),
        )
    }

    /// `busy_timeout` bounds how long SQLite waits on its file lock;
    /// `checkout_timeout` bounds how long `get` waits for a free connection.
    pub fn open_with_timeouts(
        path: &Path,
        max_size: usize,
        busy_timeout: Duration,
        checkout_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let size = u32::try_from(max_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(StoreError::InvalidPoolSize(max_size))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| configure_connection(conn, busy_timeout));
        let inner = r2d2::Pool::builder()
            .max_size(size)
            .min_idle(Some(1))
            .connection_timeout(checkout_timeout)
            .build(manager)?;
        ensure_schema(&*inner.get()?)?;

        info!(
            component = "store",
            event = "store.pool.open",
            path = %path.display(),
            max_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            inner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Checks out a connection, waiting up to the checkout timeout while all
    /// `max_size` are in use.
    pub fn get(&self) -> Result<PooledConnection, StoreError> {
        Ok(self.inner.get()?)
    }
}

fn configure_connection(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    conn.busy_timeout(busy_timeout)
}

/// Creates missing tables and appends any feature or source column the
/// current build knows about. Existing columns are never renamed or dropped.
pub fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    for source in ALL_SOURCES {
        ensure_source_table(conn, source)?;
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS watermarks (
            symbol TEXT NOT NULL,
            source TEXT NOT NULL,
            scope TEXT NOT NULL,
            last_processed_ts_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY(symbol, source, scope)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS feature_records (
            symbol TEXT NOT NULL,
            date TEXT NOT NULL,
            hour INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL,
            completeness_score REAL NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY(symbol, date, hour)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS feature_records_ts ON feature_records(ts_ms);

        CREATE TABLE IF NOT EXISTS symbol_locks (
            lock_key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        ",
    )?;

    let schema = build_feature_schema();
    for column in &schema.columns {
        add_column_if_missing(conn, "feature_records", &column.name, "REAL")?;
    }
    for group in ALL_GROUPS {
        add_column_if_missing(conn, "feature_records", group.provenance_column(), "INTEGER")?;
    }

    Ok(())
}

fn ensure_source_table(conn: &Connection, source: SourceId) -> Result<(), StoreError> {
    let table = source.table_name();
    if !table_exists(conn, table)? {
        let value_columns: Vec<String> = source
            .value_columns()
            .iter()
            .map(|name| format!("{name} REAL NOT NULL"))
            .collect();
        conn.execute_batch(&format!(
            "
            CREATE TABLE {table} (
                symbol TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                {},
                ingested_at_ms INTEGER NOT NULL,
                PRIMARY KEY(symbol, ts_ms)
            ) WITHOUT ROWID;
            ",
            value_columns.join(",\n                ")
        ))?;
        return Ok(());
    }

    for column in source.value_columns() {
        add_column_if_missing(conn, table, column, "REAL")?;
    }
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    sql_type: &str,
) -> Result<(), StoreError> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type};"))?;
    info!(
        component = "store",
        event = "store.schema.column_added",
        table,
        column
    );
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, StoreError> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Appends records to their source table. Rows already present for the same
/// `(symbol, ts_ms)` are left untouched. Returns the number of new rows.
pub fn append_source_records(
    conn: &Connection,
    source: SourceId,
    records: &[SourceRecord],
    ingested_at_ms: i64,
) -> rusqlite::Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let columns = source.value_columns();
    let placeholders: Vec<String> = (0..columns.len() + 3)
        .map(|idx| format!("?{}", idx + 1))
        .collect();
    let sql = format!(
        "INSERT INTO {} (symbol, ts_ms, {}, ingested_at_ms) VALUES ({}) ON CONFLICT(symbol, ts_ms) DO NOTHING",
        source.table_name(),
        columns.join(", "),
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut inserted = 0;
    for record in records {
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(columns.len() + 3);
        values.push(record.symbol.clone().into());
        values.push(record.ts_ms_utc.into());
        for value in &record.values {
            values.push((*value).into());
        }
        values.push(ingested_at_ms.into());
        inserted += stmt.execute(params_from_iter(values))?;
    }
    Ok(inserted)
}

pub fn max_source_ts(
    conn: &Connection,
    source: SourceId,
    symbol: &str,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        &format!(
            "SELECT MAX(ts_ms) FROM {} WHERE symbol = ?1",
            source.table_name()
        ),
        params![symbol],
        |row| row.get(0),
    )
}

/// Latest row for `symbol` with `ts_ms < end_exclusive_ms`.
pub fn latest_source_record_before(
    conn: &Connection,
    source: SourceId,
    symbol: &str,
    end_exclusive_ms: i64,
) -> rusqlite::Result<Option<SourceRecord>> {
    let columns = source.value_columns();
    let sql = format!(
        "SELECT ts_ms, {} FROM {} WHERE symbol = ?1 AND ts_ms < ?2 ORDER BY ts_ms DESC LIMIT 1",
        columns.join(", "),
        source.table_name()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row(params![symbol, end_exclusive_ms], |row| {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(row.get::<_, f64>(idx + 1)?);
        }
        Ok(SourceRecord {
            source,
            symbol: symbol.to_string(),
            ts_ms_utc: row.get(0)?,
            values,
        })
    })
    .optional()
}

pub fn count_source_range(
    conn: &Connection,
    source: SourceId,
    symbol: &str,
    start_ms: i64,
    end_exclusive_ms: i64,
) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE symbol = ?1 AND ts_ms >= ?2 AND ts_ms < ?3",
            source.table_name()
        ),
        params![symbol, start_ms, end_exclusive_ms],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn macro_record(symbol: &str, ts_ms_utc: i64, vix: f64) -> SourceRecord {
        SourceRecord {
            source: SourceId::Macro,
            symbol: symbol.to_string(),
            ts_ms_utc,
            values: vec![vix, 100.0, 4.0, 5_000.0],
        }
    }

    #[test]
    fn pool_reuses_connections_and_applies_schema() {
        let temp = tempdir().unwrap();
        let pool = ConnectionPool::open(&temp.path().join("nested/db.sqlite"), 2).unwrap();

        {
            let a = pool.get().unwrap();
            let b = pool.get().unwrap();
            assert!(table_has_column(&a, "feature_records", "vix").unwrap());
            assert!(table_has_column(&b, "feature_records", "macro_src_ts_ms").unwrap());
        }
        let again = pool.get().unwrap();
        assert!(table_exists(&again, "symbol_locks").unwrap());
        let mode: String = again
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }

    #[test]
    fn exhausted_pool_times_out_instead_of_blocking() {
        let temp = tempdir().unwrap();
        let pool = ConnectionPool::open_with_timeouts(
            &temp.path().join("db.sqlite"),
            1,
            Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            Duration::from_millis(50),
        )
        .unwrap();

        let held = pool.get().unwrap();
        assert!(matches!(pool.get(), Err(StoreError::Pool(_))));
        drop(held);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let temp = tempdir().unwrap();
        assert!(matches!(
            ConnectionPool::open(&temp.path().join("db.sqlite"), 0),
            Err(StoreError::InvalidPoolSize(0))
        ));
    }

    #[test]
    fn append_is_idempotent_and_latest_lookup_respects_bound() {
        let temp = tempdir().unwrap();
        let pool = ConnectionPool::open(&temp.path().join("db.sqlite"), 1).unwrap();
        let conn = pool.get().unwrap();

        let rows = vec![macro_record("BTC", 1_000, 18.2), macro_record("BTC", 2_000, 19.0)];
        assert_eq!(append_source_records(&conn, SourceId::Macro, &rows, 5).unwrap(), 2);
        let revised = vec![macro_record("BTC", 2_000, 99.0)];
        assert_eq!(append_source_records(&conn, SourceId::Macro, &revised, 6).unwrap(), 0);

        assert_eq!(max_source_ts(&conn, SourceId::Macro, "BTC").unwrap(), Some(2_000));
        assert_eq!(max_source_ts(&conn, SourceId::Macro, "ETH").unwrap(), None);

        let latest = latest_source_record_before(&conn, SourceId::Macro, "BTC", 2_001)
            .unwrap()
            .unwrap();
        assert_eq!(latest.value("vix"), Some(19.0));
        let earlier = latest_source_record_before(&conn, SourceId::Macro, "BTC", 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(earlier.ts_ms_utc, 1_000);
        assert!(latest_source_record_before(&conn, SourceId::Macro, "BTC", 1_000)
            .unwrap()
            .is_none());
        assert_eq!(
            count_source_range(&conn, SourceId::Macro, "BTC", 0, 2_000).unwrap(),
            1
        );
    }

    #[test]
    fn reopening_adds_missing_feature_columns_without_touching_rows() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "
                CREATE TABLE feature_records (
                    symbol TEXT NOT NULL,
                    date TEXT NOT NULL,
                    hour INTEGER NOT NULL,
                    ts_ms INTEGER NOT NULL,
                    completeness_score REAL NOT NULL DEFAULT 0,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL,
                    close REAL,
                    PRIMARY KEY(symbol, date, hour)
                ) WITHOUT ROWID;
                INSERT INTO feature_records (symbol, date, hour, ts_ms, created_at_ms, updated_at_ms, close)
                VALUES ('BTC', '2024-01-01', 10, 0, 0, 0, 42000.0);
                ",
            )
            .unwrap();
        }

        let pool = ConnectionPool::open(&path, 1).unwrap();
        let conn = pool.get().unwrap();
        assert!(table_has_column(&conn, "feature_records", "rsi_14").unwrap());
        let close: f64 = conn
            .query_row("SELECT close FROM feature_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(close, 42_000.0);
    }
}
