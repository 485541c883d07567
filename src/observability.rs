//! Shared logging configuration, initialization, and the structured events
//! operators alert on.

use std::env;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::gap::{BackfillPlan, GapDescriptor};
use crate::source::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("FEATSYNC_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("FEATSYNC_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("FEATSYNC_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(app: &str, config: &LoggingConfig) {
    info!(
        component = app,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_gap_detected(gap: &GapDescriptor) {
    info!(
        component = "collector",
        event = "collector.gap_detected",
        source = gap.source.as_str(),
        symbol = %gap.symbol,
        gap_duration_ms = gap.gap_duration_ms,
        last_known_ts_ms = gap.last_known_ts_ms,
        from_epoch_floor = gap.from_epoch_floor
    );
}

/// The part of a gap older than the backfill ceiling. It is never fetched by
/// the scheduled collector; only a manual wide backfill can recover it.
pub fn log_gap_clipped(plan: &BackfillPlan) {
    if let Some((unrecoverable_start, unrecoverable_end)) = plan.unrecoverable {
        warn!(
            component = "collector",
            event = "collector.gap_clipped",
            source = plan.source.as_str(),
            symbol = %plan.symbol,
            unrecoverable_start,
            unrecoverable_end
        );
    }
}

pub fn log_backfill_started(plan: &BackfillPlan) {
    info!(
        component = "collector",
        event = "collector.backfill_started",
        source = plan.source.as_str(),
        symbol = %plan.symbol,
        window_start = plan.start_ms,
        window_end = plan.end_ms
    );
}

pub fn log_backfill_completed(plan: &BackfillPlan, rows: usize, chunks: usize) {
    info!(
        component = "collector",
        event = "collector.backfill_completed",
        source = plan.source.as_str(),
        symbol = %plan.symbol,
        window_start = plan.start_ms,
        window_end = plan.end_ms,
        rows,
        chunks
    );
}

pub fn log_record_dropped(source: SourceId, symbol: &str, reason: &str) {
    warn!(
        component = "collector",
        event = "collector.record_dropped",
        source = source.as_str(),
        symbol,
        reason
    );
}

pub fn log_symbol_skipped(symbol: &str, reason: &str) {
    warn!(
        component = "materializer",
        event = "materializer.symbol_skipped",
        symbol,
        reason
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
