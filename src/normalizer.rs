//! Maps a source's native granularity onto the `(symbol, date, hour)` join key.
//!
//! Sub-hourly and hourly sources match the latest row inside the target
//! hour. Daily sources match the latest row inside the target date, so one
//! daily value serves all 24 hours of that day. A staleness tolerance widens
//! the accepted range backwards from the bucket start; anything older is
//! reported as stale and the fields stay null.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::features::FeatureKey;
use crate::source::{Granularity, SourceId, SourceRecord};
use crate::store::latest_source_record_before;

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid feature key {date} hour {hour}")]
    InvalidKey { date: NaiveDate, hour: u32 },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Accepted timestamp range for one source lookup: `[earliest_ms, end_exclusive_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupWindow {
    pub bucket_start_ms: i64,
    pub end_exclusive_ms: i64,
    pub earliest_ms: i64,
}

impl LookupWindow {
    pub fn accepts(&self, ts_ms: i64) -> bool {
        ts_ms >= self.earliest_ms && ts_ms < self.end_exclusive_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(SourceRecord),
    /// A row exists before the window but is older than the tolerance allows.
    Stale { latest_ts_ms: i64 },
    Missing,
}

pub fn feature_key(symbol: &str, ts_ms: i64) -> Result<FeatureKey, NormalizeError> {
    let dt = utc(ts_ms)?;
    Ok(FeatureKey {
        symbol: symbol.to_string(),
        date: dt.date_naive(),
        hour: dt.hour(),
    })
}

pub fn hour_start_ms(key: &FeatureKey) -> Result<i64, NormalizeError> {
    let day_start = day_start_ms(key.date)?;
    if key.hour > 23 {
        return Err(NormalizeError::InvalidKey {
            date: key.date,
            hour: key.hour,
        });
    }
    Ok(day_start + i64::from(key.hour) * HOUR_MS)
}

pub fn lookup_window(
    granularity: Granularity,
    key: &FeatureKey,
    staleness_tolerance_ms: i64,
) -> Result<LookupWindow, NormalizeError> {
    let bucket_start_ms = match granularity {
        Granularity::SubHourly | Granularity::Hourly => hour_start_ms(key)?,
        Granularity::Daily => day_start_ms(key.date)?,
    };
    let end_exclusive_ms = bucket_start_ms + granularity.bucket_ms();
    Ok(LookupWindow {
        bucket_start_ms,
        end_exclusive_ms,
        earliest_ms: bucket_start_ms.saturating_sub(staleness_tolerance_ms.max(0)),
    })
}

pub fn resolve(
    conn: &Connection,
    cfg: &SourceConfig,
    key: &FeatureKey,
) -> Result<Lookup, NormalizeError> {
    let window = lookup_window(cfg.granularity, key, cfg.staleness_tolerance_ms())?;
    Ok(resolve_window(conn, cfg.source, &key.symbol, &window)?)
}

/// Lookup against a precomputed window; the only fallible part is the query.
pub fn resolve_window(
    conn: &Connection,
    source: SourceId,
    symbol: &str,
    window: &LookupWindow,
) -> rusqlite::Result<Lookup> {
    let latest = latest_source_record_before(conn, source, symbol, window.end_exclusive_ms)?;
    Ok(match latest {
        Some(record) if window.accepts(record.ts_ms_utc) => Lookup::Found(record),
        Some(record) => Lookup::Stale {
            latest_ts_ms: record.ts_ms_utc,
        },
        None => Lookup::Missing,
    })
}

pub fn day_start_ms(date: NaiveDate) -> Result<i64, NormalizeError> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or(NormalizeError::InvalidKey { date, hour: 0 })
}

fn utc(ts_ms: i64) -> Result<DateTime<Utc>, NormalizeError> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .ok_or(NormalizeError::InvalidTimestamp(ts_ms))
}
