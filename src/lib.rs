//! featsync core crate.
//!
//! Current implemented scope:
//! - per-source collectors with gap detection and bounded backfill
//! - granularity-aware lookup normalization
//! - the feature materializer joining all sources into hourly feature records

mod binance_klines;
mod collector;
mod config;
mod csv_drop;
mod features;
mod gap;
mod lock;
mod materializer;
mod normalizer;
mod observability;
mod registry;
mod source;
mod store;
mod watermark;

pub use binance_klines::{BinanceKlineFetcher, BinanceKlinesConfig, BINANCE_REST_KLINES_URL};
pub use collector::{
    build_fetcher, Collector, CollectorCycleReport, CollectorError, CollectorState, FetchError,
    FetchOutcome, RejectedRecord, SourceFetcher, SymbolCollectReport,
};
pub use config::{
    pipeline_config_from_env, CollectorConfig, ConfigError, MaterializerConfig, PipelineConfig,
    SourceConfig, DEFAULT_EPOCH_FLOOR_MS,
};
pub use csv_drop::CsvDropFetcher;
pub use features::{
    assert_schema_compatible, build_feature_schema, completeness_score, count_feature_records,
    list_feature_records, read_feature_record, FeatureColumn, FeatureDType, FeatureError,
    FeatureGroup, FeatureKey, FeatureRecord, FeatureSchema, ALL_GROUPS, FEATURE_SCHEMA_VERSION,
};
pub use gap::{detect_gap, detect_gaps, last_known_ts, plan_backfill, BackfillPlan, GapDescriptor};
pub use lock::{is_transient_sqlite, lock_key, LockError, RetryPolicy, SymbolLocks};
pub use materializer::{
    run_materializer_cycle, MaterializeError, MaterializeReport, Materializer, RecordOutcome,
    SkippedSymbol, SymbolReport,
};
pub use normalizer::{
    day_start_ms, feature_key, hour_start_ms, lookup_window, resolve, resolve_window, Lookup,
    LookupWindow, NormalizeError,
};
pub use observability::{
    init_logging, log_app_start, log_backfill_completed, log_backfill_started, log_gap_clipped,
    log_gap_detected, log_record_dropped, log_symbol_skipped, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use registry::SymbolRegistry;
pub use source::{Granularity, SourceId, SourceRecord, ALL_SOURCES};
pub use store::{
    append_source_records, count_source_range, ensure_schema, latest_source_record_before,
    max_source_ts, ConnectionPool, PooledConnection, StoreError, DEFAULT_BUSY_TIMEOUT_MS,
    DEFAULT_CHECKOUT_TIMEOUT_MS,
};
pub use watermark::{advance_watermark, list_watermarks, read_watermark, Watermark, WatermarkScope};
