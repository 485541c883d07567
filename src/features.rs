//! Wide feature record layout, completeness scoring, and read access.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::source::SourceId;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// One feature group per upstream source. A group is filled from exactly one
/// source row, so its columns become non-null together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureGroup {
    Price,
    Technical,
    Macro,
    Onchain,
    Sentiment,
}

pub const ALL_GROUPS: [FeatureGroup; 5] = [
    FeatureGroup::Price,
    FeatureGroup::Technical,
    FeatureGroup::Macro,
    FeatureGroup::Onchain,
    FeatureGroup::Sentiment,
];

impl FeatureGroup {
    pub fn source(self) -> SourceId {
        match self {
            Self::Price => SourceId::Price,
            Self::Technical => SourceId::Technical,
            Self::Macro => SourceId::Macro,
            Self::Onchain => SourceId::Onchain,
            Self::Sentiment => SourceId::Sentiment,
        }
    }

    pub fn for_source(source: SourceId) -> Self {
        match source {
            SourceId::Price => Self::Price,
            SourceId::Technical => Self::Technical,
            SourceId::Macro => Self::Macro,
            SourceId::Onchain => Self::Onchain,
            SourceId::Sentiment => Self::Sentiment,
        }
    }

    /// Column holding the timestamp of the source row the group came from.
    pub fn provenance_column(self) -> &'static str {
        match self {
            Self::Price => "price_src_ts_ms",
            Self::Technical => "technical_src_ts_ms",
            Self::Macro => "macro_src_ts_ms",
            Self::Onchain => "onchain_src_ts_ms",
            Self::Sentiment => "sentiment_src_ts_ms",
        }
    }

    fn index(self) -> usize {
        ALL_GROUPS
            .iter()
            .position(|group| *group == self)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
    pub group: FeatureGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored date '{0}'")]
    InvalidDate(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Ordered feature columns: every group's source columns, groups in
/// `ALL_GROUPS` order. Downstream consumers bind by name, so columns are
/// only ever appended.
pub fn build_feature_schema() -> FeatureSchema {
    let mut columns = Vec::new();
    for group in ALL_GROUPS {
        for name in group.source().value_columns() {
            columns.push(FeatureColumn {
                name: (*name).to_string(),
                dtype: FeatureDType::F64,
                group,
            });
        }
    }

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint: schema_fingerprint(&columns),
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureKey {
    pub symbol: String,
    pub date: NaiveDate,
    pub hour: u32,
}

impl FeatureKey {
    pub fn date_text(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub key: FeatureKey,
    pub ts_ms_utc: i64,
    /// Aligned with `build_feature_schema().columns`.
    pub values: Vec<Option<f64>>,
    /// Indexed like `ALL_GROUPS`.
    pub provenance: [Option<i64>; 5],
    pub completeness_score: f64,
}

impl FeatureRecord {
    pub fn value(&self, schema: &FeatureSchema, column: &str) -> Option<f64> {
        schema
            .column_index(column)
            .and_then(|idx| self.values.get(idx).copied().flatten())
    }

    pub fn source_ts(&self, group: FeatureGroup) -> Option<i64> {
        self.provenance[group.index()]
    }

    pub fn group_present(&self, schema: &FeatureSchema, group: FeatureGroup) -> bool {
        group_present(schema, &self.values, group)
    }
}

/// Fraction of feature groups whose columns are all non-null.
pub fn completeness_score(schema: &FeatureSchema, values: &[Option<f64>]) -> f64 {
    let present = ALL_GROUPS
        .iter()
        .filter(|group| group_present(schema, values, **group))
        .count();
    present as f64 / ALL_GROUPS.len() as f64
}

fn group_present(schema: &FeatureSchema, values: &[Option<f64>], group: FeatureGroup) -> bool {
    let mut any = false;
    for (column, value) in schema.columns.iter().zip(values) {
        if column.group != group {
            continue;
        }
        if value.is_none() {
            return false;
        }
        any = true;
    }
    any
}

pub(crate) fn select_columns_sql(schema: &FeatureSchema) -> String {
    let mut names: Vec<&str> = vec!["symbol", "date", "hour", "ts_ms", "completeness_score"];
    names.extend(schema.columns.iter().map(|column| column.name.as_str()));
    names.extend(ALL_GROUPS.iter().map(|group| group.provenance_column()));
    names.join(", ")
}

pub(crate) fn record_from_row(schema: &FeatureSchema, row: &Row<'_>) -> Result<FeatureRecord, FeatureError> {
    let symbol: String = row.get(0)?;
    let date_raw: String = row.get(1)?;
    let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|_| FeatureError::InvalidDate(date_raw.clone()))?;
    let hour: u32 = row.get(2)?;

    let offset = 5;
    let mut values = Vec::with_capacity(schema.columns.len());
    for idx in 0..schema.columns.len() {
        values.push(row.get::<_, Option<f64>>(offset + idx)?);
    }
    let mut provenance = [None; 5];
    for (idx, slot) in provenance.iter_mut().enumerate() {
        *slot = row.get::<_, Option<i64>>(offset + schema.columns.len() + idx)?;
    }

    Ok(FeatureRecord {
        key: FeatureKey { symbol, date, hour },
        ts_ms_utc: row.get(3)?,
        values,
        provenance,
        completeness_score: row.get(4)?,
    })
}

pub fn read_feature_record(
    conn: &Connection,
    schema: &FeatureSchema,
    key: &FeatureKey,
) -> Result<Option<FeatureRecord>, FeatureError> {
    let sql = format!(
        "SELECT {} FROM feature_records WHERE symbol = ?1 AND date = ?2 AND hour = ?3",
        select_columns_sql(schema)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![key.symbol, key.date_text(), key.hour])?;
    match rows.next()? {
        Some(row) => Ok(Some(record_from_row(schema, row)?)),
        None => Ok(None),
    }
}

/// All records for `symbol`, oldest first.
pub fn list_feature_records(
    conn: &Connection,
    schema: &FeatureSchema,
    symbol: &str,
) -> Result<Vec<FeatureRecord>, FeatureError> {
    let sql = format!(
        "SELECT {} FROM feature_records WHERE symbol = ?1 ORDER BY ts_ms ASC",
        select_columns_sql(schema)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![symbol])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(record_from_row(schema, row)?);
    }
    Ok(out)
}

pub fn count_feature_records(conn: &Connection) -> Result<u64, FeatureError> {
    let count: Option<i64> = conn
        .query_row("SELECT COUNT(*) FROM feature_records", [], |row| row.get(0))
        .optional()?;
    Ok(count.unwrap_or_default() as u64)
}

fn schema_fingerprint(columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_order_and_fingerprint_are_deterministic() {
        let a = build_feature_schema();
        let b = build_feature_schema();
        assert_eq!(a, b);
        assert_eq!(a.version, FEATURE_SCHEMA_VERSION);
        assert_eq!(a.columns[0].name, "open");
        assert_eq!(a.columns[4].name, "volume");
        assert_eq!(a.columns[5].name, "rsi_14");
        assert_eq!(a.columns.last().map(|c| c.name.as_str()), Some("sentiment_volume"));
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn schema_compatibility_check_matches_version_and_fingerprint() {
        let schema = build_feature_schema();
        assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, &schema).unwrap();
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &schema.fingerprint, &schema),
            Err(FeatureError::SchemaVersionMismatch { .. })
        ));
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION, "not-real", &schema),
            Err(FeatureError::SchemaFingerprintMismatch { .. })
        ));
    }

    #[test]
    fn completeness_counts_fully_present_groups() {
        let schema = build_feature_schema();
        let mut values = vec![None; schema.columns.len()];
        assert_eq!(completeness_score(&schema, &values), 0.0);

        for (idx, column) in schema.columns.iter().enumerate() {
            if matches!(column.group, FeatureGroup::Price | FeatureGroup::Macro) {
                values[idx] = Some(1.0);
            }
        }
        assert!((completeness_score(&schema, &values) - 0.4).abs() < 1e-12);

        let rsi = schema.column_index("rsi_14").unwrap();
        values[rsi] = Some(55.3);
        assert!((completeness_score(&schema, &values) - 0.4).abs() < 1e-12);
    }
}
