//! Joins every source into one wide feature record per `(symbol, date, hour)`.
//!
//! One call to [`Materializer::run_cycle`] is a bounded batch: it reads price
//! rows past each symbol's materialized watermark (oldest first, capped at
//! `batch_size`), revisits recent incomplete records so slower sources can
//! catch up, and writes each symbol inside its own leased transaction.
//! Existing non-null fields are never overwritten. A symbol whose write keeps
//! failing is skipped for this cycle; symbols not reached before the soft
//! deadline are left for the next one.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{MaterializerConfig, SourceConfig};
use crate::features::{
    build_feature_schema, completeness_score, FeatureGroup, FeatureKey, FeatureSchema, ALL_GROUPS,
};
use crate::lock::{lock_key, LockError, SymbolLocks};
use crate::normalizer::{
    feature_key, hour_start_ms, lookup_window, resolve_window, Lookup, LookupWindow,
    NormalizeError,
};
use crate::observability::log_symbol_skipped;
use crate::registry::SymbolRegistry;
use crate::source::{SourceId, SourceRecord};
use crate::store::{ConnectionPool, StoreError};
use crate::watermark::{advance_watermark, WatermarkScope};

const LOCK_NAMESPACE: &str = "features";

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("normalize error: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("the price source is not configured")]
    MissingPriceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Inserted,
    Filled { fields: usize },
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolReport {
    pub symbol: String,
    pub price_rows: usize,
    pub inserted: usize,
    pub filled: usize,
    pub unchanged: usize,
    pub refilled: usize,
    pub watermark_ts_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeReport {
    pub price_rows_read: usize,
    pub committed: Vec<SymbolReport>,
    pub skipped: Vec<SkippedSymbol>,
    pub deferred: Vec<String>,
}

impl MaterializeReport {
    pub fn records_inserted(&self) -> usize {
        self.committed.iter().map(|s| s.inserted).sum()
    }

    pub fn records_filled(&self) -> usize {
        self.committed.iter().map(|s| s.filled + s.refilled).sum()
    }

    pub fn committed_symbol(&self, symbol: &str) -> Option<&SymbolReport> {
        self.committed.iter().find(|s| s.symbol == symbol)
    }

    pub fn is_skipped(&self, symbol: &str) -> bool {
        self.skipped.iter().any(|s| s.symbol == symbol)
    }
}

/// A unit of work: one symbol's new price rows plus its incomplete records
/// inside the refill lookback.
#[derive(Debug, Clone)]
struct SymbolWork {
    symbol: String,
    price_rows: Vec<SourceRecord>,
    refill_keys: Vec<FeatureKey>,
}

struct PlannedRow {
    key: FeatureKey,
    hour_start_ms: i64,
    price: SourceRecord,
    windows: Vec<(SourceId, LookupWindow)>,
}

struct PlannedRefill {
    key: FeatureKey,
    hour_start_ms: i64,
    windows: Vec<(SourceId, LookupWindow)>,
}

pub struct Materializer<'a> {
    pool: &'a ConnectionPool,
    registry: &'a SymbolRegistry,
    sources: Vec<SourceConfig>,
    cfg: MaterializerConfig,
    schema: FeatureSchema,
}

impl<'a> Materializer<'a> {
    pub fn new(
        pool: &'a ConnectionPool,
        registry: &'a SymbolRegistry,
        sources: &[SourceConfig],
        cfg: MaterializerConfig,
    ) -> Result<Self, MaterializeError> {
        if !sources.iter().any(|s| s.source == SourceId::Price) {
            return Err(MaterializeError::MissingPriceSource);
        }
        Ok(Self {
            pool,
            registry,
            sources: sources.to_vec(),
            cfg,
            schema: build_feature_schema(),
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn run_cycle(&self, now_ms: i64) -> Result<MaterializeReport, MaterializeError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.cfg.deadline_ms);

        info!(
            component = "materializer",
            event = "materializer.cycle.start",
            batch_size = self.cfg.batch_size,
            workers = self.cfg.workers,
            deadline_ms = self.cfg.deadline_ms
        );

        let (work, price_rows_read) = {
            let conn = self.pool.get()?;
            self.collect_work(&conn, now_ms)?
        };

        let mut report = MaterializeReport {
            price_rows_read,
            ..MaterializeReport::default()
        };
        if work.is_empty() {
            info!(
                component = "materializer",
                event = "materializer.cycle.finish",
                price_rows_read,
                committed = 0,
                skipped = 0,
                deferred = 0
            );
            return Ok(report);
        }

        let locks = SymbolLocks::new(self.cfg.lease_ttl_ms, self.cfg.lock_retry);
        let queue = Mutex::new(work.into_iter().collect::<VecDeque<_>>());
        let results: Mutex<Vec<Result<SymbolReport, SkippedSymbol>>> = Mutex::new(Vec::new());
        let worker_count = self
            .cfg
            .workers
            .max(1)
            .min(self.pool.max_size())
            .min(queue.lock().unwrap_or_else(PoisonError::into_inner).len());

        thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| self.worker_loop(&queue, &results, &locks, deadline, now_ms));
            }
        });

        for result in results.into_inner().unwrap_or_else(PoisonError::into_inner) {
            match result {
                Ok(summary) => report.committed.push(summary),
                Err(skipped) => report.skipped.push(skipped),
            }
        }
        report.deferred = queue
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .map(|work| work.symbol)
            .collect();
        report.committed.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        report.skipped.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        for symbol in &report.deferred {
            log_symbol_skipped(symbol, "deadline");
        }

        info!(
            component = "materializer",
            event = "materializer.cycle.finish",
            price_rows_read = report.price_rows_read,
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            deferred = report.deferred.len(),
            records_inserted = report.records_inserted(),
            records_filled = report.records_filled(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        Ok(report)
    }

    fn worker_loop(
        &self,
        queue: &Mutex<VecDeque<SymbolWork>>,
        results: &Mutex<Vec<Result<SymbolReport, SkippedSymbol>>>,
        locks: &SymbolLocks,
        deadline: Instant,
        now_ms: i64,
    ) {
        loop {
            if Instant::now() >= deadline {
                return;
            }
            let Some(work) = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            else {
                return;
            };

            let symbol = work.symbol.clone();
            let outcome = self
                .pool
                .get()
                .map_err(MaterializeError::from)
                .and_then(|mut conn| self.materialize_symbol(&mut conn, locks, &work, now_ms));

            let entry = match outcome {
                Ok(summary) => Ok(summary),
                Err(err) => {
                    let reason = err.to_string();
                    log_symbol_skipped(&symbol, &reason);
                    Err(SkippedSymbol { symbol, reason })
                }
            };
            results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry);
        }
    }

    fn collect_work(
        &self,
        conn: &Connection,
        now_ms: i64,
    ) -> Result<(Vec<SymbolWork>, usize), MaterializeError> {
        let symbols: Vec<&str> = self.registry.symbols().collect();
        if symbols.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let price_rows = self.read_new_price_rows(conn, &symbols)?;
        let price_rows_read = price_rows.len();

        let mut by_symbol: BTreeMap<String, SymbolWork> = BTreeMap::new();
        for row in price_rows {
            by_symbol
                .entry(row.symbol.clone())
                .or_insert_with(|| SymbolWork {
                    symbol: row.symbol.clone(),
                    price_rows: Vec::new(),
                    refill_keys: Vec::new(),
                })
                .price_rows
                .push(row);
        }

        let since_ms = now_ms.saturating_sub(self.cfg.refill_lookback_ms);
        for key in self.read_refill_candidates(conn, &symbols, since_ms)? {
            by_symbol
                .entry(key.symbol.clone())
                .or_insert_with(|| SymbolWork {
                    symbol: key.symbol.clone(),
                    price_rows: Vec::new(),
                    refill_keys: Vec::new(),
                })
                .refill_keys
                .push(key);
        }

        Ok((by_symbol.into_values().collect(), price_rows_read))
    }

    /// Price rows newer than each symbol's materialized watermark, capped at
    /// `batch_size` across all symbols. Symbols take turns: every symbol's
    /// oldest pending row is selected before any symbol's second, so a
    /// backlogged or contended symbol cannot crowd the others out.
    fn read_new_price_rows(
        &self,
        conn: &Connection,
        symbols: &[&str],
    ) -> Result<Vec<SourceRecord>, MaterializeError> {
        let columns = SourceId::Price.value_columns();
        let select_columns: Vec<String> = columns.iter().map(|c| format!("p.{c}")).collect();
        let placeholders: Vec<String> = (0..symbols.len()).map(|idx| format!("?{}", idx + 3)).collect();
        let sql = format!(
            "
            SELECT symbol, ts_ms, {}
            FROM (
                SELECT p.symbol, p.ts_ms, {},
                       ROW_NUMBER() OVER (PARTITION BY p.symbol ORDER BY p.ts_ms ASC) AS turn
                FROM src_price p
                LEFT JOIN watermarks w
                  ON w.symbol = p.symbol AND w.source = 'price' AND w.scope = 'materialized'
                WHERE p.ts_ms > COALESCE(w.last_processed_ts_ms, ?1)
                  AND p.symbol IN ({})
            )
            ORDER BY turn ASC, ts_ms ASC, symbol ASC
            LIMIT ?2
            ",
            columns.join(", "),
            select_columns.join(", "),
            placeholders.join(", ")
        );

        let mut bind: Vec<rusqlite::types::Value> = Vec::with_capacity(symbols.len() + 2);
        bind.push(i64::MIN.into());
        bind.push(i64::try_from(self.cfg.batch_size).unwrap_or(i64::MAX).into());
        for symbol in symbols {
            bind.push((*symbol).to_string().into());
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(row.get::<_, f64>(idx + 2)?);
            }
            out.push(SourceRecord {
                source: SourceId::Price,
                symbol: row.get(0)?,
                ts_ms_utc: row.get(1)?,
                values,
            });
        }
        Ok(out)
    }

    fn read_refill_candidates(
        &self,
        conn: &Connection,
        symbols: &[&str],
        since_ms: i64,
    ) -> Result<Vec<FeatureKey>, MaterializeError> {
        let tracked: BTreeSet<&str> = symbols.iter().copied().collect();
        let mut stmt = conn.prepare(
            "
            SELECT symbol, date, hour
            FROM feature_records
            WHERE completeness_score < 1.0 AND ts_ms >= ?1
            ORDER BY ts_ms ASC
            ",
        )?;
        let mut rows = stmt.query(params![since_ms])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let symbol: String = row.get(0)?;
            if !tracked.contains(symbol.as_str()) {
                continue;
            }
            let date_raw: String = row.get(1)?;
            let Ok(date) = chrono::NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d") else {
                continue;
            };
            out.push(FeatureKey {
                symbol,
                date,
                hour: row.get(2)?,
            });
        }
        Ok(out)
    }

    fn lookup_windows(
        &self,
        key: &FeatureKey,
        include_price: bool,
    ) -> Result<Vec<(SourceId, LookupWindow)>, NormalizeError> {
        let mut out = Vec::with_capacity(self.sources.len());
        for cfg in &self.sources {
            if cfg.source == SourceId::Price && !include_price {
                continue;
            }
            out.push((
                cfg.source,
                lookup_window(cfg.granularity, key, cfg.staleness_tolerance_ms())?,
            ));
        }
        Ok(out)
    }

    fn materialize_symbol(
        &self,
        conn: &mut Connection,
        locks: &SymbolLocks,
        work: &SymbolWork,
        now_ms: i64,
    ) -> Result<SymbolReport, MaterializeError> {
        let mut refills = Vec::with_capacity(work.refill_keys.len());
        for key in &work.refill_keys {
            refills.push(PlannedRefill {
                key: key.clone(),
                hour_start_ms: hour_start_ms(key)?,
                windows: self.lookup_windows(key, true)?,
            });
        }

        let mut planned = Vec::with_capacity(work.price_rows.len());
        for row in &work.price_rows {
            let key = feature_key(&work.symbol, row.ts_ms_utc)?;
            planned.push(PlannedRow {
                hour_start_ms: hour_start_ms(&key)?,
                windows: self.lookup_windows(&key, false)?,
                key,
                price: row.clone(),
            });
        }

        let key = lock_key(LOCK_NAMESPACE, &work.symbol);
        let summary = locks.run_locked(conn, &key, |tx| {
            let mut summary = SymbolReport {
                symbol: work.symbol.clone(),
                price_rows: planned.len(),
                ..SymbolReport::default()
            };
            let mut contributed: BTreeMap<SourceId, i64> = BTreeMap::new();

            for refill in &refills {
                let resolved = resolve_all(tx, &work.symbol, &refill.windows, &mut contributed)?;
                let outcome = self.upsert_record(tx, &refill.key, refill.hour_start_ms, resolved, now_ms)?;
                if let RecordOutcome::Filled { .. } = outcome {
                    summary.refilled += 1;
                }
            }

            for row in &planned {
                let mut resolved = resolve_all(tx, &work.symbol, &row.windows, &mut contributed)?;
                resolved.push((FeatureGroup::Price, row.price.clone()));
                match self.upsert_record(tx, &row.key, row.hour_start_ms, resolved, now_ms)? {
                    RecordOutcome::Inserted => summary.inserted += 1,
                    RecordOutcome::Filled { .. } => summary.filled += 1,
                    RecordOutcome::Unchanged => summary.unchanged += 1,
                }
            }

            if let Some(last) = planned.last() {
                let stored = advance_watermark(
                    tx,
                    &work.symbol,
                    SourceId::Price,
                    WatermarkScope::Materialized,
                    last.price.ts_ms_utc,
                )?;
                summary.watermark_ts_ms = Some(stored);
            }
            for (source, ts_ms) in &contributed {
                if *source != SourceId::Price {
                    advance_watermark(tx, &work.symbol, *source, WatermarkScope::Materialized, *ts_ms)?;
                }
            }

            Ok(summary)
        })?;

        debug!(
            component = "materializer",
            event = "materializer.symbol.committed",
            symbol = %summary.symbol,
            price_rows = summary.price_rows,
            inserted = summary.inserted,
            filled = summary.filled,
            refilled = summary.refilled
        );
        Ok(summary)
    }

    /// Inserts a new record or fills only its null fields. Skips the write
    /// when nothing would change so a repeated pass leaves rows untouched.
    fn upsert_record(
        &self,
        tx: &Transaction<'_>,
        key: &FeatureKey,
        hour_start_ms: i64,
        resolved: Vec<(FeatureGroup, SourceRecord)>,
        now_ms: i64,
    ) -> rusqlite::Result<RecordOutcome> {
        let column_count = self.schema.columns.len();
        let mut incoming: Vec<Option<f64>> = vec![None; column_count];
        let mut incoming_provenance: [Option<i64>; 5] = [None; 5];
        for (group, record) in &resolved {
            for (idx, column) in self.schema.columns.iter().enumerate() {
                if column.group == *group {
                    incoming[idx] = record.value(&column.name);
                }
            }
            if let Some(slot) = ALL_GROUPS.iter().position(|g| g == group) {
                incoming_provenance[slot] = Some(record.ts_ms_utc);
            }
        }

        let existing = self.load_existing(tx, key)?;
        let (merged, filled, outcome_if_changed) = match &existing {
            Some(current) => {
                let mut merged = current.clone();
                let mut filled = 0;
                for (slot, value) in merged.iter_mut().zip(&incoming) {
                    if slot.is_none() && value.is_some() {
                        *slot = *value;
                        filled += 1;
                    }
                }
                (merged, filled, RecordOutcome::Filled { fields: filled })
            }
            None => (incoming.clone(), 0, RecordOutcome::Inserted),
        };
        if existing.is_some() && filled == 0 {
            return Ok(RecordOutcome::Unchanged);
        }

        let score = completeness_score(&self.schema, &merged);
        let provenance_columns: Vec<&str> = ALL_GROUPS.iter().map(|g| g.provenance_column()).collect();
        let mut insert_columns: Vec<&str> = vec![
            "symbol",
            "date",
            "hour",
            "ts_ms",
            "completeness_score",
            "created_at_ms",
            "updated_at_ms",
        ];
        insert_columns.extend(self.schema.columns.iter().map(|c| c.name.as_str()));
        insert_columns.extend(provenance_columns.iter().copied());

        let placeholders: Vec<String> = (1..=insert_columns.len()).map(|idx| format!("?{idx}")).collect();
        let fill_assignments: Vec<String> = self
            .schema
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .chain(provenance_columns.iter().copied())
            .map(|name| format!("{name} = COALESCE(feature_records.{name}, excluded.{name})"))
            .collect();
        let sql = format!(
            "
            INSERT INTO feature_records ({})
            VALUES ({})
            ON CONFLICT(symbol, date, hour) DO UPDATE SET
                {},
                completeness_score = excluded.completeness_score,
                updated_at_ms = excluded.updated_at_ms
            ",
            insert_columns.join(", "),
            placeholders.join(", "),
            fill_assignments.join(",\n                ")
        );

        let mut bind: Vec<rusqlite::types::Value> = Vec::with_capacity(insert_columns.len());
        bind.push(key.symbol.clone().into());
        bind.push(key.date_text().into());
        bind.push(i64::from(key.hour).into());
        bind.push(hour_start_ms.into());
        bind.push(score.into());
        bind.push(now_ms.into());
        bind.push(now_ms.into());
        for value in &incoming {
            bind.push(option_value(value.map(rusqlite::types::Value::Real)));
        }
        for ts in &incoming_provenance {
            bind.push(option_value(ts.map(rusqlite::types::Value::Integer)));
        }

        tx.prepare_cached(&sql)?.execute(params_from_iter(bind))?;
        Ok(outcome_if_changed)
    }

    fn load_existing(
        &self,
        tx: &Transaction<'_>,
        key: &FeatureKey,
    ) -> rusqlite::Result<Option<Vec<Option<f64>>>> {
        let names: Vec<&str> = self.schema.columns.iter().map(|c| c.name.as_str()).collect();
        let sql = format!(
            "SELECT {} FROM feature_records WHERE symbol = ?1 AND date = ?2 AND hour = ?3",
            names.join(", ")
        );
        let mut stmt = tx.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![key.symbol, key.date_text(), key.hour])?;
        match rows.next()? {
            Some(row) => {
                let mut values = Vec::with_capacity(names.len());
                for idx in 0..names.len() {
                    values.push(row.get::<_, Option<f64>>(idx)?);
                }
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }
}

fn resolve_all(
    tx: &Transaction<'_>,
    symbol: &str,
    windows: &[(SourceId, LookupWindow)],
    contributed: &mut BTreeMap<SourceId, i64>,
) -> rusqlite::Result<Vec<(FeatureGroup, SourceRecord)>> {
    let mut out = Vec::with_capacity(windows.len());
    for (source, window) in windows {
        match resolve_window(tx, *source, symbol, window)? {
            Lookup::Found(record) => {
                let entry = contributed.entry(*source).or_insert(record.ts_ms_utc);
                *entry = (*entry).max(record.ts_ms_utc);
                out.push((FeatureGroup::for_source(*source), record));
            }
            Lookup::Stale { latest_ts_ms } => {
                debug!(
                    component = "materializer",
                    event = "materializer.lookup.stale",
                    source = source.as_str(),
                    symbol,
                    bucket_start_ms = window.bucket_start_ms,
                    latest_ts_ms
                );
            }
            Lookup::Missing => {}
        }
    }
    Ok(out)
}

fn option_value(value: Option<rusqlite::types::Value>) -> rusqlite::types::Value {
    value.unwrap_or(rusqlite::types::Value::Null)
}

/// Convenience for callers that materialize with the wall clock.
pub fn run_materializer_cycle(materializer: &Materializer<'_>) -> Result<MaterializeReport, MaterializeError> {
    materializer.run_cycle(Utc::now().timestamp_millis())
}
