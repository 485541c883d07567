//! Price source fetcher: Binance spot hourly klines over REST.

use std::thread::sleep;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::collector::{FetchError, FetchOutcome, RejectedRecord, SourceFetcher};
use crate::source::{SourceId, SourceRecord};

pub const BINANCE_REST_KLINES_URL: &str = "https://api.binance.com/api/v3/klines";
const KLINE_INTERVAL: &str = "1h";
const KLINE_STEP_MS: i64 = 3_600_000;
const PAGE_LIMIT: usize = 1_000;
const KLINE_MIN_FIELDS: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinanceKlinesConfig {
    pub base_url: String,
    /// Appended to the canonical symbol to form the trading pair, e.g. `BTC` + `USDT`.
    pub quote_asset: String,
    pub http_timeout_ms: u64,
    pub page_pause_ms: u64,
}

impl Default for BinanceKlinesConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_REST_KLINES_URL.to_string(),
            quote_asset: "USDT".to_string(),
            http_timeout_ms: 15_000,
            page_pause_ms: 25,
        }
    }
}

pub struct BinanceKlineFetcher {
    cfg: BinanceKlinesConfig,
    http: Box<dyn HttpFetcher>,
}

impl BinanceKlineFetcher {
    pub fn new(cfg: BinanceKlinesConfig) -> Result<Self, FetchError> {
        let http = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self {
            cfg,
            http: Box::new(http),
        })
    }

    #[cfg(test)]
    fn with_http(cfg: BinanceKlinesConfig, http: Box<dyn HttpFetcher>) -> Self {
        Self { cfg, http }
    }

    pub fn pair_for(&self, symbol: &str) -> String {
        format!("{}{}", symbol, self.cfg.quote_asset)
    }

    fn page_url(&self, pair: &str, cursor_ms: i64, end_inclusive_ms: i64) -> String {
        format!(
            "{}?symbol={pair}&interval={KLINE_INTERVAL}&startTime={cursor_ms}&endTime={end_inclusive_ms}&limit={PAGE_LIMIT}",
            self.cfg.base_url
        )
    }
}

impl SourceFetcher for BinanceKlineFetcher {
    fn source(&self) -> SourceId {
        SourceId::Price
    }

    fn fetch(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<FetchOutcome, FetchError> {
        let pair = self.pair_for(symbol);
        let mut outcome = FetchOutcome::default();
        let mut cursor = start_ms;
        // endTime is inclusive upstream.
        let end_inclusive_ms = end_ms.saturating_sub(1);

        while cursor < end_ms {
            let url = self.page_url(&pair, cursor, end_inclusive_ms);
            let body = self.http.get_bytes(&url)?;
            let payload: Value = serde_json::from_slice(&body).map_err(|err| FetchError::Payload {
                origin: url.clone(),
                message: err.to_string(),
            })?;
            let rows = payload.as_array().ok_or_else(|| FetchError::Payload {
                origin: url.clone(),
                message: "expected top-level array".to_string(),
            })?;
            if rows.is_empty() {
                break;
            }

            let mut last_open_time = None;
            for row in rows {
                match parse_rest_kline_row(row) {
                    Ok(kline) => {
                        last_open_time = Some(kline.open_time_ms);
                        if kline.open_time_ms < start_ms || kline.open_time_ms >= end_ms {
                            continue;
                        }
                        outcome.records.push(SourceRecord {
                            source: SourceId::Price,
                            symbol: symbol.to_string(),
                            ts_ms_utc: kline.open_time_ms,
                            values: vec![kline.open, kline.high, kline.low, kline.close, kline.volume],
                        });
                    }
                    Err(reason) => outcome.rejected.push(RejectedRecord { reason }),
                }
            }

            let Some(last_open_time) = last_open_time else {
                break;
            };
            let next_cursor = last_open_time.saturating_add(KLINE_STEP_MS);
            if next_cursor <= cursor {
                return Err(FetchError::Payload {
                    origin: url,
                    message: format!("cursor did not advance: cursor={cursor} next={next_cursor}"),
                });
            }
            debug!(
                component = "binance_klines",
                event = "binance.page",
                pair = %pair,
                rows = rows.len(),
                cursor,
                next_cursor
            );
            cursor = next_cursor;

            if rows.len() < PAGE_LIMIT {
                break;
            }
            if self.cfg.page_pause_ms > 0 {
                sleep(Duration::from_millis(self.cfg.page_pause_ms));
            }
        }

        Ok(outcome)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Kline {
    open_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

fn parse_rest_kline_row(value: &Value) -> Result<Kline, String> {
    let row = value
        .as_array()
        .ok_or_else(|| "unexpected REST row: expected array".to_string())?;
    if row.len() < KLINE_MIN_FIELDS {
        return Err(format!("unexpected REST row length: {}", row.len()));
    }

    Ok(Kline {
        open_time_ms: json_i64(&row[0], "open_time")?,
        open: json_f64(&row[1], "open")?,
        high: json_f64(&row[2], "high")?,
        low: json_f64(&row[3], "low")?,
        close: json_f64(&row[4], "close")?,
        volume: json_f64(&row[5], "volume")?,
    })
}

fn json_i64(value: &Value, field: &str) -> Result<i64, String> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    value
        .as_str()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| format!("field {field}: expected i64-compatible value, got {value}"))
}

fn json_f64(value: &Value, field: &str) -> Result<f64, String> {
    if let Some(v) = value.as_f64() {
        return Ok(v);
    }
    value
        .as_str()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| format!("field {field}: expected f64-compatible value, got {value}"))
}

trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HOUR_MS: i64 = 3_600_000;
    const T0: i64 = 1_704_103_200_000; // 2024-01-01T10:00:00Z

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.responses.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    url: url.to_string(),
                    status: 503,
                })
        }
    }

    fn cfg() -> BinanceKlinesConfig {
        BinanceKlinesConfig {
            base_url: "http://mock/klines".to_string(),
            page_pause_ms: 0,
            ..BinanceKlinesConfig::default()
        }
    }

    fn kline_json(open_time_ms: i64, close: &str) -> String {
        format!(
            r#"[{open_time_ms},"42000.0","42100.5","41900.0","{close}","12.5",{},"525000.0",310,"6.1","256000.0","0"]"#,
            open_time_ms + HOUR_MS - 1
        )
    }

    fn url(start: i64, end_inclusive: i64) -> String {
        format!(
            "http://mock/klines?symbol=BTCUSDT&interval=1h&startTime={start}&endTime={end_inclusive}&limit=1000"
        )
    }

    #[test]
    fn parses_string_and_numeric_fields_into_price_records() {
        let body = format!("[{},{}]", kline_json(T0, "42050.0"), kline_json(T0 + HOUR_MS, "42075.25"));
        let http = MockFetcher::default().with(&url(T0, T0 + 2 * HOUR_MS - 1), &body);
        let fetcher = BinanceKlineFetcher::with_http(cfg(), Box::new(http));

        let outcome = fetcher.fetch("BTC", T0, T0 + 2 * HOUR_MS).unwrap();
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].symbol, "BTC");
        assert_eq!(outcome.records[0].ts_ms_utc, T0);
        assert_eq!(outcome.records[1].value("close"), Some(42_075.25));
        assert_eq!(outcome.records[1].value("volume"), Some(12.5));
    }

    #[test]
    fn malformed_rows_are_rejected_individually() {
        let body = format!(
            r#"[{},[1,"2"],{}]"#,
            kline_json(T0, "not-a-number"),
            kline_json(T0 + HOUR_MS, "42000.0")
        );
        let http = MockFetcher::default().with(&url(T0, T0 + 2 * HOUR_MS - 1), &body);
        let fetcher = BinanceKlineFetcher::with_http(cfg(), Box::new(http));

        let outcome = fetcher.fetch("BTC", T0, T0 + 2 * HOUR_MS).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].ts_ms_utc, T0 + HOUR_MS);
        assert_eq!(outcome.rejected.len(), 2);
        assert!(outcome.rejected[0].reason.contains("close"));
    }

    #[test]
    fn full_page_continues_from_next_open_time() {
        let end = T0 + 1_001 * HOUR_MS;
        let first_page: Vec<String> = (0..1_000).map(|i| kline_json(T0 + i * HOUR_MS, "1.0")).collect();
        let second_page = kline_json(T0 + 1_000 * HOUR_MS, "2.0");
        let http = MockFetcher::default()
            .with(&url(T0, end - 1), &format!("[{}]", first_page.join(",")))
            .with(&url(T0 + 1_000 * HOUR_MS, end - 1), &format!("[{second_page}]"));
        let fetcher = BinanceKlineFetcher::with_http(cfg(), Box::new(http));

        let outcome = fetcher.fetch("BTC", T0, end).unwrap();
        assert_eq!(outcome.records.len(), 1_001);
        assert_eq!(outcome.records.last().unwrap().value("close"), Some(2.0));
    }

    #[test]
    fn non_array_payload_is_a_payload_error() {
        let http = MockFetcher::default().with(
            &url(T0, T0 + HOUR_MS - 1),
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        let fetcher = BinanceKlineFetcher::with_http(cfg(), Box::new(http));
        let err = fetcher.fetch("BTC", T0, T0 + HOUR_MS).unwrap_err();
        assert!(matches!(err, FetchError::Payload { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_upstream_response_surfaces_transient_status() {
        let fetcher = BinanceKlineFetcher::with_http(cfg(), Box::new(MockFetcher::default()));
        let err = fetcher.fetch("BTC", T0, T0 + HOUR_MS).unwrap_err();
        assert!(err.is_transient());
    }
}
