//! Upstream source types and their per-source table layout.

use std::fmt;

use serde::{Deserialize, Serialize};

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Price,
    Technical,
    Macro,
    Onchain,
    Sentiment,
}

pub const ALL_SOURCES: [SourceId; 5] = [
    SourceId::Price,
    SourceId::Technical,
    SourceId::Macro,
    SourceId::Onchain,
    SourceId::Sentiment,
];

impl SourceId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Technical => "technical",
            Self::Macro => "macro",
            Self::Onchain => "onchain",
            Self::Sentiment => "sentiment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        ALL_SOURCES
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Price => "src_price",
            Self::Technical => "src_technical",
            Self::Macro => "src_macro",
            Self::Onchain => "src_onchain",
            Self::Sentiment => "src_sentiment",
        }
    }

    /// Value columns, in storage order. New columns may only be appended.
    pub fn value_columns(self) -> &'static [&'static str] {
        match self {
            Self::Price => &["open", "high", "low", "close", "volume"],
            Self::Technical => &[
                "rsi_14",
                "sma_20",
                "macd",
                "macd_signal",
                "bb_upper",
                "bb_lower",
            ],
            Self::Macro => &["vix", "dxy", "us10y", "spx"],
            Self::Onchain => &["active_addresses", "tx_count", "exchange_netflow"],
            Self::Sentiment => &["sentiment_score", "sentiment_volume"],
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time resolution at which a source's rows are distinct.
///
/// Declared per source in configuration and consumed only by the lookup
/// normalizer; never derived from column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[serde(alias = "sub-hourly")]
    SubHourly,
    Hourly,
    Daily,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubHourly => "sub_hourly",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }

    pub fn bucket_ms(self) -> i64 {
        match self {
            Self::SubHourly | Self::Hourly => HOUR_MS,
            Self::Daily => 24 * HOUR_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: SourceId,
    pub symbol: String,
    pub ts_ms_utc: i64,
    /// Aligned with `source.value_columns()`.
    pub values: Vec<f64>,
}

impl SourceRecord {
    pub fn value(&self, column: &str) -> Option<f64> {
        self.source
            .value_columns()
            .iter()
            .position(|name| *name == column)
            .and_then(|idx| self.values.get(idx).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_names_case_insensitively() {
        for source in ALL_SOURCES {
            assert_eq!(SourceId::parse(source.as_str()), Some(source));
        }
        assert_eq!(SourceId::parse(" MACRO "), Some(SourceId::Macro));
        assert_eq!(SourceId::parse("news"), None);
    }

    #[test]
    fn granularity_accepts_hyphenated_sub_hourly() {
        let parsed: Granularity = serde_json::from_str("\"sub-hourly\"").unwrap();
        assert_eq!(parsed, Granularity::SubHourly);
        let parsed: Granularity = serde_json::from_str("\"daily\"").unwrap();
        assert_eq!(parsed, Granularity::Daily);
        assert!(serde_json::from_str::<Granularity>("\"weekly\"").is_err());
    }

    #[test]
    fn record_value_resolves_by_column_name() {
        let record = SourceRecord {
            source: SourceId::Macro,
            symbol: "BTC".to_string(),
            ts_ms_utc: 0,
            values: vec![18.2, 103.1, 4.2, 4_700.0],
        };
        assert_eq!(record.value("vix"), Some(18.2));
        assert_eq!(record.value("spx"), Some(4_700.0));
        assert_eq!(record.value("rsi_14"), None);
    }
}
