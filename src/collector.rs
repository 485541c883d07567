//! Generic source collector: gap check, bounded backfill, incremental fetch.
//!
//! Each invocation of [`Collector::run_cycle`] walks
//! `Idle -> GapCheck -> (Backfilling | Idle) -> IncrementalCollect -> Idle`
//! once for every tracked symbol and then returns. Nothing is held across
//! invocations except what is committed to the database, so the next tick
//! resumes from the watermark left by the last committed chunk.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::binance_klines::{BinanceKlineFetcher, BinanceKlinesConfig};
use crate::config::{CollectorConfig, PipelineConfig, SourceConfig};
use crate::csv_drop::CsvDropFetcher;
use crate::gap::{detect_gap, last_known_ts, plan_backfill, BackfillPlan, GapDescriptor};
use crate::lock::{lock_key, LockError, SymbolLocks};
use crate::observability::{
    log_backfill_completed, log_backfill_started, log_gap_clipped, log_gap_detected,
    log_record_dropped,
};
use crate::registry::SymbolRegistry;
use crate::source::{SourceId, SourceRecord};
use crate::store::{append_source_records, ConnectionPool, StoreError};
use crate::watermark::{advance_watermark, WatermarkScope};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("unexpected payload from {origin}: {message}")]
    Payload { origin: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl FetchError {
    /// Network failures, throttling, and upstream 5xx are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpRequest { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// A row the upstream returned that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<SourceRecord>,
    pub rejected: Vec<RejectedRecord>,
}

/// Upstream client for one source. `fetch` returns rows with
/// `start_ms <= ts < end_ms`; per-row parse failures go to `rejected`
/// instead of failing the whole call.
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> SourceId;

    fn fetch(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<FetchOutcome, FetchError>;
}

/// Fetcher for `source` as configured: Binance klines for price, the CSV
/// drop directory for everything else. `None` when no drop root is set.
pub fn build_fetcher(
    config: &PipelineConfig,
    source: SourceId,
) -> Result<Option<Box<dyn SourceFetcher>>, FetchError> {
    if source == SourceId::Price {
        let cfg = BinanceKlinesConfig {
            quote_asset: config.binance_quote_asset.clone(),
            ..BinanceKlinesConfig::default()
        };
        return Ok(Some(Box::new(BinanceKlineFetcher::new(cfg)?)));
    }
    Ok(config
        .csv_drop_root
        .as_ref()
        .map(|root| Box::new(CsvDropFetcher::new(root.clone(), source)) as Box<dyn SourceFetcher>))
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("fetcher serves {fetcher} but collector is configured for {configured}")]
    SourceMismatch {
        fetcher: SourceId,
        configured: SourceId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorState {
    Idle,
    GapCheck,
    Backfilling,
    IncrementalCollect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolCollectReport {
    pub symbol: String,
    pub gap: Option<GapDescriptor>,
    pub backfill: Option<BackfillPlan>,
    pub chunks_committed: usize,
    pub rows_inserted: usize,
    pub rows_dropped: usize,
    /// Set when a fetch or write gave up; the symbol is retried next tick.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorCycleReport {
    pub source: SourceId,
    pub now_ms: i64,
    pub transitions: Vec<CollectorState>,
    pub symbols: Vec<SymbolCollectReport>,
}

impl CollectorCycleReport {
    pub fn symbol(&self, symbol: &str) -> Option<&SymbolCollectReport> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }

    pub fn rows_inserted(&self) -> usize {
        self.symbols.iter().map(|s| s.rows_inserted).sum()
    }

    pub fn failed_symbols(&self) -> Vec<&str> {
        self.symbols
            .iter()
            .filter(|s| s.failure.is_some())
            .map(|s| s.symbol.as_str())
            .collect()
    }
}

pub struct Collector<'a> {
    pool: &'a ConnectionPool,
    registry: &'a SymbolRegistry,
    source_cfg: SourceConfig,
    cfg: CollectorConfig,
    epoch_floor_ms: i64,
    fetcher: &'a dyn SourceFetcher,
    locks: SymbolLocks,
    state: CollectorState,
}

impl<'a> Collector<'a> {
    pub fn new(
        pool: &'a ConnectionPool,
        registry: &'a SymbolRegistry,
        source_cfg: SourceConfig,
        cfg: CollectorConfig,
        epoch_floor_ms: i64,
        fetcher: &'a dyn SourceFetcher,
    ) -> Result<Self, CollectorError> {
        if fetcher.source() != source_cfg.source {
            return Err(CollectorError::SourceMismatch {
                fetcher: fetcher.source(),
                configured: source_cfg.source,
            });
        }
        let locks = SymbolLocks::new(cfg.lease_ttl_ms, cfg.lock_retry);
        Ok(Self {
            pool,
            registry,
            source_cfg,
            cfg,
            epoch_floor_ms,
            fetcher,
            locks,
            state: CollectorState::Idle,
        })
    }

    pub fn source(&self) -> SourceId {
        self.source_cfg.source
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn run_cycle(&mut self, now_ms: i64) -> Result<CollectorCycleReport, CollectorError> {
        let source = self.source();
        let pool = self.pool;
        let mut conn = pool.get()?;
        let mut report = CollectorCycleReport {
            source,
            now_ms,
            transitions: vec![self.state],
            symbols: Vec::with_capacity(self.registry.len()),
        };

        info!(
            component = "collector",
            event = "collector.cycle.start",
            source = source.as_str(),
            symbols = self.registry.len(),
            now_ms
        );

        self.transition(&mut report, CollectorState::GapCheck);
        let mut pending = Vec::with_capacity(self.registry.len());
        for symbol in self.registry.symbols() {
            let gap = detect_gap(&conn, &self.source_cfg, symbol, now_ms, self.epoch_floor_ms)?;
            pending.push(SymbolCollectReport {
                symbol: symbol.to_string(),
                gap,
                ..SymbolCollectReport::default()
            });
        }

        if pending.iter().any(|s| s.gap.is_some()) {
            self.transition(&mut report, CollectorState::Backfilling);
            for entry in pending.iter_mut() {
                let Some(gap) = entry.gap.clone() else {
                    continue;
                };
                log_gap_detected(&gap);
                let plan = plan_backfill(&gap, &self.source_cfg);
                log_gap_clipped(&plan);
                self.backfill(&mut conn, &plan, entry, now_ms);
                entry.backfill = Some(plan);
            }
        }

        self.transition(&mut report, CollectorState::IncrementalCollect);
        for entry in pending.iter_mut() {
            if entry.failure.is_some() {
                continue;
            }
            if let Err(err) = self.collect_tail(&mut conn, now_ms, entry) {
                warn!(
                    component = "collector",
                    event = "collector.symbol_failed",
                    source = source.as_str(),
                    symbol = %entry.symbol,
                    stage = "incremental",
                    error = %err
                );
                entry.failure = Some(err.to_string());
            }
        }

        self.transition(&mut report, CollectorState::Idle);
        report.symbols = pending;

        info!(
            component = "collector",
            event = "collector.cycle.finish",
            source = source.as_str(),
            rows_inserted = report.rows_inserted(),
            failed = report.failed_symbols().len()
        );
        Ok(report)
    }

    fn transition(&mut self, report: &mut CollectorCycleReport, next: CollectorState) {
        debug!(
            component = "collector",
            event = "collector.state",
            source = self.source().as_str(),
            from = ?self.state,
            to = ?next
        );
        self.state = next;
        report.transitions.push(next);
    }

    /// Runs an explicit plan outside the scheduled cycle, e.g. a manual
    /// wide-range recovery. The backfill ceiling is not applied here.
    pub fn run_backfill(
        &self,
        plan: &BackfillPlan,
        now_ms: i64,
    ) -> Result<SymbolCollectReport, CollectorError> {
        let pool = self.pool;
        let mut conn = pool.get()?;
        let mut entry = SymbolCollectReport {
            symbol: plan.symbol.clone(),
            ..SymbolCollectReport::default()
        };
        log_gap_clipped(plan);
        self.backfill(&mut conn, plan, &mut entry, now_ms);
        entry.backfill = Some(plan.clone());
        Ok(entry)
    }

    /// Fetches the plan chunk by chunk. A chunk that cannot be fetched or
    /// committed ends this symbol's backfill so the watermark never passes
    /// data that was not written.
    fn backfill(
        &self,
        conn: &mut Connection,
        plan: &BackfillPlan,
        entry: &mut SymbolCollectReport,
        now_ms: i64,
    ) {
        log_backfill_started(plan);
        for (start_ms, end_ms) in plan.chunks(self.cfg.backfill_chunk_ms) {
            let open_ended = end_ms >= now_ms;
            match self.fetch_and_commit(conn, &plan.symbol, start_ms, end_ms, open_ended) {
                Ok((inserted, dropped)) => {
                    entry.chunks_committed += 1;
                    entry.rows_inserted += inserted;
                    entry.rows_dropped += dropped;
                }
                Err(err) => {
                    warn!(
                        component = "collector",
                        event = "collector.chunk_failed",
                        source = plan.source.as_str(),
                        symbol = %plan.symbol,
                        chunk_start = start_ms,
                        chunk_end = end_ms,
                        error = %err
                    );
                    entry.failure = Some(err.to_string());
                    return;
                }
            }
        }

        log_backfill_completed(plan, entry.rows_inserted, entry.chunks_committed);
    }

    /// Regular collection of whatever arrived since the last known point.
    fn collect_tail(
        &self,
        conn: &mut Connection,
        now_ms: i64,
        entry: &mut SymbolCollectReport,
    ) -> Result<(), CollectorError> {
        let start_ms = match last_known_ts(conn, self.source(), &entry.symbol)? {
            Some(ts) => ts.saturating_add(1),
            None => self
                .epoch_floor_ms
                .max(now_ms.saturating_sub(self.source_cfg.max_backfill_window_ms())),
        };
        if start_ms >= now_ms {
            return Ok(());
        }
        let (inserted, dropped) = self.fetch_and_commit(conn, &entry.symbol, start_ms, now_ms, true)?;
        entry.rows_inserted += inserted;
        entry.rows_dropped += dropped;
        Ok(())
    }

    /// One fetch-validate-append unit. A closed range `[start, end)` advances
    /// the collected watermark to `end - 1` even when empty: the watermark
    /// names the last instant known to be collected, and `end` itself was not
    /// fetched. A range ending at `now` only advances to the newest accepted
    /// row, since upstream may still publish rows inside it.
    fn fetch_and_commit(
        &self,
        conn: &mut Connection,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        open_ended: bool,
    ) -> Result<(usize, usize), CollectorError> {
        let source = self.source();
        let outcome = self.cfg.fetch_retry.retry(FetchError::is_transient, |attempt| {
            if attempt > 0 {
                debug!(
                    component = "collector",
                    event = "collector.fetch_retry",
                    source = source.as_str(),
                    symbol,
                    attempt
                );
            }
            self.fetcher.fetch(symbol, start_ms, end_ms)
        })?;

        let mut dropped = outcome.rejected.len();
        for rejected in &outcome.rejected {
            log_record_dropped(source, symbol, &rejected.reason);
        }
        let mut accepted = Vec::with_capacity(outcome.records.len());
        for record in outcome.records {
            match self.validate(record, symbol, start_ms, end_ms) {
                Ok(record) => accepted.push(record),
                Err(reason) => {
                    log_record_dropped(source, symbol, &reason);
                    dropped += 1;
                }
            }
        }

        let advance_to = if open_ended {
            accepted.iter().map(|r| r.ts_ms_utc).max()
        } else {
            Some(end_ms.saturating_sub(1))
        };

        let ingested_at_ms = chrono::Utc::now().timestamp_millis();
        let key = lock_key(source.as_str(), symbol);
        let inserted = self.locks.run_locked(conn, &key, |tx| {
            let inserted = append_source_records(tx, source, &accepted, ingested_at_ms)?;
            if let Some(ts_ms) = advance_to {
                advance_watermark(tx, symbol, source, WatermarkScope::Collected, ts_ms)?;
            }
            Ok(inserted)
        })?;

        debug!(
            component = "collector",
            event = "collector.range.committed",
            source = source.as_str(),
            symbol,
            range_start = start_ms,
            range_end = end_ms,
            inserted,
            dropped
        );
        Ok((inserted, dropped))
    }

    fn validate(
        &self,
        mut record: SourceRecord,
        requested: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<SourceRecord, String> {
        let Some(canonical) = self.registry.canonicalize(&record.symbol) else {
            return Err(format!("unknown symbol '{}'", record.symbol));
        };
        if canonical != requested {
            return Err(format!("symbol '{canonical}' does not match requested '{requested}'"));
        }
        record.symbol = canonical.to_string();

        if record.source != self.source() {
            return Err(format!(
                "record tagged {} in {} collector",
                record.source,
                self.source()
            ));
        }
        if record.ts_ms_utc < start_ms || record.ts_ms_utc >= end_ms {
            return Err(format!(
                "timestamp {} outside [{start_ms}, {end_ms})",
                record.ts_ms_utc
            ));
        }
        let expected = self.source().value_columns().len();
        if record.values.len() != expected {
            return Err(format!(
                "expected {expected} values, got {}",
                record.values.len()
            ));
        }
        if let Some(idx) = record.values.iter().position(|v| !v.is_finite()) {
            return Err(format!(
                "non-finite value for {}",
                self.source().value_columns()[idx]
            ));
        }
        Ok(record)
    }
}
