//! Pipeline configuration: per-source surface plus materializer and collector
//! tuning, loaded from a JSON document.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::lock::RetryPolicy;
use crate::registry::SymbolRegistry;
use crate::source::{Granularity, SourceId};

const DAY_SECS: u64 = 86_400;

/// 2024-01-01T00:00:00Z
pub const DEFAULT_EPOCH_FLOOR_MS: i64 = 1_704_067_200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceConfig {
    pub source: SourceId,
    pub granularity: Granularity,
    pub refresh_interval_secs: u64,
    pub max_backfill_window_secs: u64,
    pub staleness_tolerance_secs: u64,
}

impl SourceConfig {
    /// Default cadence and ceilings for a source. Granularity is passed in
    /// because it is never defaulted.
    pub fn with_defaults(source: SourceId, granularity: Granularity) -> Self {
        let (refresh_interval_secs, max_backfill_window_secs) = match source {
            SourceId::Price => (300, 7 * DAY_SECS),
            SourceId::Technical => (3_600, 30 * DAY_SECS),
            SourceId::Macro => (DAY_SECS, 90 * DAY_SECS),
            SourceId::Onchain => (DAY_SECS, 30 * DAY_SECS),
            SourceId::Sentiment => (3_600, 30 * DAY_SECS),
        };
        Self {
            source,
            granularity,
            refresh_interval_secs,
            max_backfill_window_secs,
            staleness_tolerance_secs: 0,
        }
    }

    pub fn refresh_interval_ms(&self) -> i64 {
        secs_to_ms(self.refresh_interval_secs)
    }

    pub fn max_backfill_window_ms(&self) -> i64 {
        secs_to_ms(self.max_backfill_window_secs)
    }

    pub fn staleness_tolerance_ms(&self) -> i64 {
        secs_to_ms(self.staleness_tolerance_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializerConfig {
    pub batch_size: usize,
    /// Per-symbol work units run on this many threads. SQLite admits one
    /// writer per file, so extra workers overlap only their reads and
    /// lookups; each one's write waits on the others for up to the busy
    /// timeout and then counts against `lock_retry`. Raise it together with
    /// `lock_retry` and keep per-symbol batches short.
    pub workers: usize,
    pub deadline_ms: u64,
    pub lease_ttl_ms: u64,
    pub lock_retry: RetryPolicy,
    /// Incomplete records newer than `now - refill_lookback_ms` are revisited
    /// each cycle so late-arriving sources can fill their null fields.
    pub refill_lookback_ms: i64,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            workers: 1,
            deadline_ms: 120_000,
            lease_ttl_ms: 60_000,
            lock_retry: RetryPolicy::default(),
            refill_lookback_ms: secs_to_ms(2 * DAY_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub fetch_retry: RetryPolicy,
    pub backfill_chunk_ms: i64,
    pub lease_ttl_ms: u64,
    pub lock_retry: RetryPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            fetch_retry: RetryPolicy::default(),
            backfill_chunk_ms: secs_to_ms(DAY_SECS),
            lease_ttl_ms: 60_000,
            lock_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub epoch_floor_ms: i64,
    pub registry: SymbolRegistry,
    pub sources: Vec<SourceConfig>,
    pub materializer: MaterializerConfig,
    pub collector: CollectorConfig,
    pub csv_drop_root: Option<PathBuf>,
    pub binance_quote_asset: String,
}

impl PipelineConfig {
    pub fn source(&self, source: SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|cfg| cfg.source == source)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let parsed: RawPipelineConfig = serde_json::from_str(raw)?;
        parsed.validate()
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("unknown source '{0}'")]
    UnknownSource(String),
    #[error("source '{0}' declares no granularity")]
    MissingGranularity(String),
    #[error("source '{0}' is configured more than once")]
    DuplicateSource(String),
    #[error("the price source must be configured")]
    MissingPriceSource,
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: String,
        message: String,
    },
}

/// Loads `FEATSYNC_CONFIG`, then applies `FEATSYNC_DB_PATH` if set.
pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let path = env::var("FEATSYNC_CONFIG").map_err(|_| ConfigError::MissingEnv("FEATSYNC_CONFIG"))?;
    let mut config = PipelineConfig::from_path(Path::new(path.trim()))?;

    if let Ok(db_path) = env::var("FEATSYNC_DB_PATH") {
        let trimmed = db_path.trim();
        if !trimmed.is_empty() {
            config.db_path = PathBuf::from(trimmed);
        }
    }

    Ok(config)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipelineConfig {
    db_path: PathBuf,
    symbols: Vec<String>,
    #[serde(default)]
    symbol_aliases: BTreeMap<String, String>,
    #[serde(default)]
    epoch_floor_ms: Option<i64>,
    sources: Vec<RawSourceConfig>,
    #[serde(default)]
    materializer: RawMaterializerConfig,
    #[serde(default)]
    collector: RawCollectorConfig,
    #[serde(default)]
    csv_drop_root: Option<PathBuf>,
    #[serde(default)]
    binance_quote_asset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSourceConfig {
    source: String,
    #[serde(default)]
    granularity: Option<Granularity>,
    #[serde(default)]
    refresh_interval_secs: Option<u64>,
    #[serde(default)]
    max_backfill_window_secs: Option<u64>,
    #[serde(default)]
    staleness_tolerance_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMaterializerConfig {
    batch_size: Option<usize>,
    workers: Option<usize>,
    deadline_ms: Option<u64>,
    lease_ttl_ms: Option<u64>,
    lock_retry: Option<RetryPolicy>,
    refill_lookback_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCollectorConfig {
    fetch_retry: Option<RetryPolicy>,
    backfill_chunk_ms: Option<i64>,
    lease_ttl_ms: Option<u64>,
    lock_retry: Option<RetryPolicy>,
}

impl RawPipelineConfig {
    fn validate(self) -> Result<PipelineConfig, ConfigError> {
        let mut registry = SymbolRegistry::new(&self.symbols);
        if registry.is_empty() {
            return Err(invalid("symbols", "at least one symbol must be tracked"));
        }
        for (alias, canonical) in &self.symbol_aliases {
            if !registry.add_alias(alias, canonical) {
                return Err(invalid(
                    "symbol_aliases",
                    format!("alias '{alias}' points at untracked symbol '{canonical}'"),
                ));
            }
        }

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(self.sources.len());
        for raw in self.sources {
            let source = SourceId::parse(&raw.source)
                .ok_or_else(|| ConfigError::UnknownSource(raw.source.clone()))?;
            let granularity = raw
                .granularity
                .ok_or_else(|| ConfigError::MissingGranularity(raw.source.clone()))?;
            if !seen.insert(source) {
                return Err(ConfigError::DuplicateSource(raw.source));
            }

            let mut cfg = SourceConfig::with_defaults(source, granularity);
            if let Some(v) = raw.refresh_interval_secs {
                cfg.refresh_interval_secs = v;
            }
            if let Some(v) = raw.max_backfill_window_secs {
                cfg.max_backfill_window_secs = v;
            }
            if let Some(v) = raw.staleness_tolerance_secs {
                cfg.staleness_tolerance_secs = v;
            }
            if cfg.refresh_interval_secs == 0 {
                return Err(invalid(
                    format!("{}.refresh_interval_secs", source.as_str()),
                    "must be > 0",
                ));
            }
            if cfg.max_backfill_window_secs == 0 {
                return Err(invalid(
                    format!("{}.max_backfill_window_secs", source.as_str()),
                    "must be > 0",
                ));
            }
            sources.push(cfg);
        }
        if !seen.contains(&SourceId::Price) {
            return Err(ConfigError::MissingPriceSource);
        }

        let mut materializer = MaterializerConfig::default();
        if let Some(v) = self.materializer.batch_size {
            materializer.batch_size = v;
        }
        if let Some(v) = self.materializer.workers {
            materializer.workers = v;
        }
        if let Some(v) = self.materializer.deadline_ms {
            materializer.deadline_ms = v;
        }
        if let Some(v) = self.materializer.lease_ttl_ms {
            materializer.lease_ttl_ms = v;
        }
        if let Some(v) = self.materializer.lock_retry {
            materializer.lock_retry = v;
        }
        if let Some(v) = self.materializer.refill_lookback_ms {
            materializer.refill_lookback_ms = v;
        }
        if materializer.batch_size == 0 {
            return Err(invalid("materializer.batch_size", "must be > 0"));
        }
        if materializer.workers == 0 {
            return Err(invalid("materializer.workers", "must be > 0"));
        }
        if materializer.deadline_ms == 0 {
            return Err(invalid("materializer.deadline_ms", "must be > 0"));
        }
        if materializer.refill_lookback_ms < 0 {
            return Err(invalid("materializer.refill_lookback_ms", "must be >= 0"));
        }

        let mut collector = CollectorConfig::default();
        if let Some(v) = self.collector.fetch_retry {
            collector.fetch_retry = v;
        }
        if let Some(v) = self.collector.backfill_chunk_ms {
            collector.backfill_chunk_ms = v;
        }
        if let Some(v) = self.collector.lease_ttl_ms {
            collector.lease_ttl_ms = v;
        }
        if let Some(v) = self.collector.lock_retry {
            collector.lock_retry = v;
        }
        if collector.backfill_chunk_ms <= 0 {
            return Err(invalid("collector.backfill_chunk_ms", "must be > 0"));
        }

        Ok(PipelineConfig {
            db_path: self.db_path,
            epoch_floor_ms: self.epoch_floor_ms.unwrap_or(DEFAULT_EPOCH_FLOOR_MS),
            registry,
            sources,
            materializer,
            collector,
            csv_drop_root: self.csv_drop_root,
            binance_quote_asset: self
                .binance_quote_asset
                .unwrap_or_else(|| "USDT".to_string()),
        })
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "db_path": "data/features.sqlite",
        "symbols": ["BTC", "ETH"],
        "symbol_aliases": {"BTCUSDT": "BTC"},
        "sources": [
            {"source": "price", "granularity": "sub_hourly"},
            {"source": "macro", "granularity": "daily", "staleness_tolerance_secs": 3600}
        ],
        "materializer": {"batch_size": 100, "lock_retry": {"max_retries": 2, "base_delay_ms": 5, "max_delay_ms": 20}}
    }"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = PipelineConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(cfg.epoch_floor_ms, DEFAULT_EPOCH_FLOOR_MS);
        assert_eq!(cfg.registry.canonicalize("btcusdt"), Some("BTC"));
        assert_eq!(cfg.materializer.batch_size, 100);
        assert_eq!(cfg.materializer.workers, 1);
        assert_eq!(cfg.materializer.deadline_ms, 120_000);
        assert_eq!(cfg.materializer.lock_retry.max_retries, 2);
        assert_eq!(cfg.binance_quote_asset, "USDT");

        let macro_cfg = cfg.source(SourceId::Macro).unwrap();
        assert_eq!(macro_cfg.granularity, Granularity::Daily);
        assert_eq!(macro_cfg.max_backfill_window_secs, 90 * DAY_SECS);
        assert_eq!(macro_cfg.staleness_tolerance_ms(), 3_600_000);
        assert!(cfg.source(SourceId::Technical).is_none());
    }

    #[test]
    fn missing_granularity_is_fatal() {
        let raw = r#"{
            "db_path": "x.sqlite",
            "symbols": ["BTC"],
            "sources": [
                {"source": "price", "granularity": "sub_hourly"},
                {"source": "onchain"}
            ]
        }"#;
        let err = PipelineConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingGranularity(ref s) if s == "onchain"));
    }

    #[test]
    fn rejects_duplicate_unknown_and_priceless_configs() {
        let dup = r#"{"db_path": "x", "symbols": ["BTC"], "sources": [
            {"source": "price", "granularity": "hourly"},
            {"source": "price", "granularity": "hourly"}]}"#;
        assert!(matches!(
            PipelineConfig::from_json_str(dup).unwrap_err(),
            ConfigError::DuplicateSource(_)
        ));

        let unknown = r#"{"db_path": "x", "symbols": ["BTC"], "sources": [
            {"source": "news", "granularity": "hourly"}]}"#;
        assert!(matches!(
            PipelineConfig::from_json_str(unknown).unwrap_err(),
            ConfigError::UnknownSource(_)
        ));

        let no_price = r#"{"db_path": "x", "symbols": ["BTC"], "sources": [
            {"source": "macro", "granularity": "daily"}]}"#;
        assert!(matches!(
            PipelineConfig::from_json_str(no_price).unwrap_err(),
            ConfigError::MissingPriceSource
        ));
    }

    #[test]
    fn zero_deadline_is_rejected() {
        let raw = r#"{"db_path": "x", "symbols": ["BTC"],
            "sources": [{"source": "price", "granularity": "hourly"}],
            "materializer": {"deadline_ms": 0}}"#;
        match PipelineConfig::from_json_str(raw).unwrap_err() {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "materializer.deadline_ms"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn alias_to_untracked_symbol_is_rejected() {
        let raw = r#"{"db_path": "x", "symbols": ["BTC"],
            "symbol_aliases": {"SOLUSDT": "SOL"},
            "sources": [{"source": "price", "granularity": "hourly"}]}"#;
        assert!(matches!(
            PipelineConfig::from_json_str(raw).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
