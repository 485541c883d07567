//! File-drop fetcher for sources exported as CSV by an upstream job.
//!
//! Layout is `<root>/<source>/<SYMBOL>.csv` with a header row naming
//! `timestamp_ms` and every value column of the source, in any order.
//! Extra columns are ignored.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use tracing::debug;

use crate::collector::{FetchError, FetchOutcome, RejectedRecord, SourceFetcher};
use crate::source::{SourceId, SourceRecord};

const TIMESTAMP_COLUMN: &str = "timestamp_ms";

pub struct CsvDropFetcher {
    root: PathBuf,
    source: SourceId,
}

impl CsvDropFetcher {
    pub fn new(root: impl Into<PathBuf>, source: SourceId) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.root
            .join(self.source.as_str())
            .join(format!("{symbol}.csv"))
    }
}

impl SourceFetcher for CsvDropFetcher {
    fn source(&self) -> SourceId {
        self.source
    }

    fn fetch(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<FetchOutcome, FetchError> {
        let path = self.path_for(symbol);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(
                    component = "csv_drop",
                    event = "csv_drop.file_missing",
                    source = self.source.as_str(),
                    path = %path.display()
                );
                return Ok(FetchOutcome::default());
            }
            Err(err) => return Err(err.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(file);
        let layout = ColumnLayout::from_header(&path, reader.headers()?, self.source)?;

        let mut outcome = FetchOutcome::default();
        for (line, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    outcome.rejected.push(RejectedRecord {
                        reason: format!("row {}: {err}", line + 1),
                    });
                    continue;
                }
            };
            match layout.parse(&record) {
                Ok((ts_ms_utc, values)) => {
                    if ts_ms_utc < start_ms || ts_ms_utc >= end_ms {
                        continue;
                    }
                    outcome.records.push(SourceRecord {
                        source: self.source,
                        symbol: symbol.to_string(),
                        ts_ms_utc,
                        values,
                    });
                }
                Err(reason) => outcome.rejected.push(RejectedRecord {
                    reason: format!("row {}: {reason}", line + 1),
                }),
            }
        }

        outcome.records.sort_by_key(|record| record.ts_ms_utc);
        Ok(outcome)
    }
}

/// Header positions for the timestamp and each value column, in the
/// source's column order.
struct ColumnLayout {
    timestamp: usize,
    values: Vec<(&'static str, usize)>,
}

impl ColumnLayout {
    fn from_header(path: &Path, header: &StringRecord, source: SourceId) -> Result<Self, FetchError> {
        let position = |name: &str| header.iter().position(|h| h.eq_ignore_ascii_case(name));
        let missing = |name: &str| FetchError::Payload {
            origin: path.display().to_string(),
            message: format!("header is missing column '{name}'"),
        };

        let timestamp = position(TIMESTAMP_COLUMN).ok_or_else(|| missing(TIMESTAMP_COLUMN))?;
        let mut values = Vec::with_capacity(source.value_columns().len());
        for name in source.value_columns() {
            values.push((*name, position(name).ok_or_else(|| missing(name))?));
        }
        Ok(Self { timestamp, values })
    }

    fn parse(&self, record: &StringRecord) -> Result<(i64, Vec<f64>), String> {
        let ts_raw = record.get(self.timestamp).unwrap_or_default();
        let ts_ms_utc = ts_raw
            .parse::<i64>()
            .map_err(|_| format!("invalid {TIMESTAMP_COLUMN} '{ts_raw}'"))?;

        let mut values = Vec::with_capacity(self.values.len());
        for (name, idx) in &self.values {
            let raw = record.get(*idx).unwrap_or_default();
            let value = raw
                .parse::<f64>()
                .map_err(|_| format!("invalid {name} '{raw}'"))?;
            values.push(value);
        }
        Ok((ts_ms_utc, values))
    }
}
