//! Gap detection and bounded backfill planning for one source.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;
use crate::source::SourceId;
use crate::store::max_source_ts;
use crate::watermark::{read_watermark, WatermarkScope};

/// How far behind one source is for one symbol. Produced and consumed within
/// a single collector cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapDescriptor {
    pub source: SourceId,
    pub symbol: String,
    pub last_known_ts_ms: i64,
    pub now_ms: i64,
    pub gap_duration_ms: i64,
    pub capped_backfill_start_ms: i64,
    /// No row and no watermark existed; `last_known_ts_ms` is the epoch floor.
    pub from_epoch_floor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub source: SourceId,
    pub symbol: String,
    pub start_ms: i64,
    pub end_ms: i64,
    /// `[start, end)` older than the ceiling that this plan will never fetch.
    pub unrecoverable: Option<(i64, i64)>,
}

impl BackfillPlan {
    /// Splits `[start_ms, end_ms)` into consecutive chunks of at most `chunk_ms`.
    pub fn chunks(&self, chunk_ms: i64) -> Vec<(i64, i64)> {
        let chunk_ms = chunk_ms.max(1);
        let mut out = Vec::new();
        let mut cursor = self.start_ms;
        while cursor < self.end_ms {
            let next = cursor.saturating_add(chunk_ms).min(self.end_ms);
            out.push((cursor, next));
            cursor = next;
        }
        out
    }
}

/// Most recent point known to be collected: the newer of the source table's
/// `MAX(ts_ms)` and the collector watermark.
pub fn last_known_ts(
    conn: &Connection,
    source: SourceId,
    symbol: &str,
) -> rusqlite::Result<Option<i64>> {
    let max_row = max_source_ts(conn, source, symbol)?;
    let watermark = read_watermark(conn, symbol, source, WatermarkScope::Collected)?;
    Ok(match (max_row, watermark) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    })
}

pub fn detect_gap(
    conn: &Connection,
    cfg: &SourceConfig,
    symbol: &str,
    now_ms: i64,
    epoch_floor_ms: i64,
) -> rusqlite::Result<Option<GapDescriptor>> {
    let known = last_known_ts(conn, cfg.source, symbol)?;
    let from_epoch_floor = known.is_none();
    let last_known_ts_ms = known.unwrap_or(epoch_floor_ms);

    let gap_duration_ms = now_ms.saturating_sub(last_known_ts_ms);
    if gap_duration_ms <= cfg.refresh_interval_ms() {
        return Ok(None);
    }

    Ok(Some(GapDescriptor {
        source: cfg.source,
        symbol: symbol.to_string(),
        last_known_ts_ms,
        now_ms,
        gap_duration_ms,
        capped_backfill_start_ms: capped_start(last_known_ts_ms, now_ms, cfg),
        from_epoch_floor,
    }))
}

/// Runs `detect_gap` for each symbol, returning only the symbols that owe a backfill.
pub fn detect_gaps<'a>(
    conn: &Connection,
    cfg: &SourceConfig,
    symbols: impl IntoIterator<Item = &'a str>,
    now_ms: i64,
    epoch_floor_ms: i64,
) -> rusqlite::Result<Vec<GapDescriptor>> {
    let mut out = Vec::new();
    for symbol in symbols {
        if let Some(gap) = detect_gap(conn, cfg, symbol, now_ms, epoch_floor_ms)? {
            out.push(gap);
        }
    }
    Ok(out)
}

/// `start = max(last_known, now - max_backfill_window)`, `end = now`.
pub fn plan_backfill(gap: &GapDescriptor, cfg: &SourceConfig) -> BackfillPlan {
    let start_ms = capped_start(gap.last_known_ts_ms, gap.now_ms, cfg);
    let unrecoverable = (gap.last_known_ts_ms < start_ms).then_some((gap.last_known_ts_ms, start_ms));
    BackfillPlan {
        source: gap.source,
        symbol: gap.symbol.clone(),
        start_ms,
        end_ms: gap.now_ms,
        unrecoverable,
    }
}

fn capped_start(last_known_ts_ms: i64, now_ms: i64, cfg: &SourceConfig) -> i64 {
    let ceiling = now_ms.saturating_sub(cfg.max_backfill_window_ms());
    last_known_ts_ms.max(ceiling).min(now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Granularity, SourceRecord};
    use crate::store::{append_source_records, ensure_schema};
    use crate::watermark::advance_watermark;

    const DAY_MS: i64 = 86_400_000;
    const NOW: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn technical_cfg() -> SourceConfig {
        SourceConfig::with_defaults(SourceId::Technical, Granularity::Hourly)
    }

    fn technical_row(ts_ms_utc: i64) -> SourceRecord {
        SourceRecord {
            source: SourceId::Technical,
            symbol: "BTC".to_string(),
            ts_ms_utc,
            values: vec![50.0, 1.0, 0.1, 0.2, 2.0, 0.5],
        }
    }

    #[test]
    fn no_gap_within_refresh_interval() {
        let conn = conn();
        append_source_records(&conn, SourceId::Technical, &[technical_row(NOW - 1_800_000)], 0)
            .unwrap();
        assert!(detect_gap(&conn, &technical_cfg(), "BTC", NOW, 0).unwrap().is_none());
    }

    #[test]
    fn gap_uses_newer_of_table_and_watermark() {
        let conn = conn();
        append_source_records(&conn, SourceId::Technical, &[technical_row(NOW - 10 * DAY_MS)], 0)
            .unwrap();
        advance_watermark(&conn, "BTC", SourceId::Technical, WatermarkScope::Collected, NOW - 2 * DAY_MS)
            .unwrap();

        let gap = detect_gap(&conn, &technical_cfg(), "BTC", NOW, 0).unwrap().unwrap();
        assert_eq!(gap.last_known_ts_ms, NOW - 2 * DAY_MS);
        assert_eq!(gap.gap_duration_ms, 2 * DAY_MS);
        assert!(!gap.from_epoch_floor);

        let plan = plan_backfill(&gap, &technical_cfg());
        assert_eq!(plan.start_ms, NOW - 2 * DAY_MS);
        assert_eq!(plan.end_ms, NOW);
        assert_eq!(plan.unrecoverable, None);
    }

    #[test]
    fn long_gap_is_clipped_to_ceiling() {
        let conn = conn();
        append_source_records(&conn, SourceId::Technical, &[technical_row(NOW - 400 * DAY_MS)], 0)
            .unwrap();
        let cfg = technical_cfg();

        let gap = detect_gap(&conn, &cfg, "BTC", NOW, 0).unwrap().unwrap();
        assert_eq!(gap.gap_duration_ms, 400 * DAY_MS);
        assert_eq!(gap.capped_backfill_start_ms, NOW - 30 * DAY_MS);

        let plan = plan_backfill(&gap, &cfg);
        assert_eq!(plan.start_ms, NOW - 30 * DAY_MS);
        assert_eq!(plan.unrecoverable, Some((NOW - 400 * DAY_MS, NOW - 30 * DAY_MS)));
    }

    #[test]
    fn empty_source_starts_from_epoch_floor() {
        let conn = conn();
        let cfg = technical_cfg();
        let gap = detect_gap(&conn, &cfg, "ETH", NOW, NOW - 5 * DAY_MS).unwrap().unwrap();
        assert!(gap.from_epoch_floor);
        assert_eq!(gap.last_known_ts_ms, NOW - 5 * DAY_MS);
        assert_eq!(plan_backfill(&gap, &cfg).start_ms, NOW - 5 * DAY_MS);
    }

    #[test]
    fn chunks_cover_plan_without_overlap() {
        let plan = BackfillPlan {
            source: SourceId::Technical,
            symbol: "BTC".to_string(),
            start_ms: 0,
            end_ms: 2 * DAY_MS + 5,
            unrecoverable: None,
        };
        assert_eq!(
            plan.chunks(DAY_MS),
            vec![(0, DAY_MS), (DAY_MS, 2 * DAY_MS), (2 * DAY_MS, 2 * DAY_MS + 5)]
        );
    }
}
