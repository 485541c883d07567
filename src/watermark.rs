//! Per-(symbol, source) progress markers.
//!
//! Two writers keep separate scopes so neither can mask the other: a
//! collector records how far its source table is known complete, the
//! materializer records how far that source has been joined into feature
//! records. Every write goes through `MAX(old, new)`.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::source::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkScope {
    Collected,
    Materialized,
}

impl WatermarkScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collected => "collected",
            Self::Materialized => "materialized",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "collected" => Some(Self::Collected),
            "materialized" => Some(Self::Materialized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub symbol: String,
    pub source: SourceId,
    pub scope: WatermarkScope,
    pub last_processed_ts_ms: i64,
    pub updated_at_ms: i64,
}

pub fn read_watermark(
    conn: &Connection,
    symbol: &str,
    source: SourceId,
    scope: WatermarkScope,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "
        SELECT last_processed_ts_ms
        FROM watermarks
        WHERE symbol = ?1 AND source = ?2 AND scope = ?3
        ",
        params![symbol, source.as_str(), scope.as_str()],
        |row| row.get(0),
    )
    .optional()
}

/// Moves the watermark forward to `ts_ms` unless it is already further
/// ahead. Returns the value stored after the write.
pub fn advance_watermark(
    conn: &Connection,
    symbol: &str,
    source: SourceId,
    scope: WatermarkScope,
    ts_ms: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        "
        INSERT INTO watermarks (symbol, source, scope, last_processed_ts_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(symbol, source, scope) DO UPDATE SET
            last_processed_ts_ms = MAX(watermarks.last_processed_ts_ms, excluded.last_processed_ts_ms),
            updated_at_ms = excluded.updated_at_ms
        ",
        params![
            symbol,
            source.as_str(),
            scope.as_str(),
            ts_ms,
            Utc::now().timestamp_millis()
        ],
    )?;
    read_watermark(conn, symbol, source, scope).map(|stored| stored.unwrap_or(ts_ms))
}

pub fn list_watermarks(conn: &Connection) -> rusqlite::Result<Vec<Watermark>> {
    let mut stmt = conn.prepare(
        "
        SELECT symbol, source, scope, last_processed_ts_ms, updated_at_ms
        FROM watermarks
        ORDER BY symbol ASC, source ASC, scope ASC
        ",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let source_raw: String = row.get(1)?;
        let scope_raw: String = row.get(2)?;
        let (Some(source), Some(scope)) =
            (SourceId::parse(&source_raw), WatermarkScope::parse(&scope_raw))
        else {
            continue;
        };
        out.push(Watermark {
            symbol: row.get(0)?,
            source,
            scope,
            last_processed_ts_ms: row.get(3)?,
            updated_at_ms: row.get(4)?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ensure_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn watermark_never_moves_backward() {
        let conn = conn();
        let scope = WatermarkScope::Materialized;
        assert_eq!(read_watermark(&conn, "BTC", SourceId::Price, scope).unwrap(), None);

        assert_eq!(advance_watermark(&conn, "BTC", SourceId::Price, scope, 2_000).unwrap(), 2_000);
        assert_eq!(advance_watermark(&conn, "BTC", SourceId::Price, scope, 1_000).unwrap(), 2_000);
        assert_eq!(advance_watermark(&conn, "BTC", SourceId::Price, scope, 3_000).unwrap(), 3_000);
        assert_eq!(read_watermark(&conn, "BTC", SourceId::Price, scope).unwrap(), Some(3_000));
    }

    #[test]
    fn scopes_and_sources_are_independent() {
        let conn = conn();
        advance_watermark(&conn, "BTC", SourceId::Price, WatermarkScope::Collected, 9_000).unwrap();
        advance_watermark(&conn, "BTC", SourceId::Price, WatermarkScope::Materialized, 1_000).unwrap();
        advance_watermark(&conn, "BTC", SourceId::Macro, WatermarkScope::Collected, 5_000).unwrap();

        assert_eq!(
            read_watermark(&conn, "BTC", SourceId::Price, WatermarkScope::Materialized).unwrap(),
            Some(1_000)
        );
        let all = list_watermarks(&conn).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].source, SourceId::Macro);
    }
}
