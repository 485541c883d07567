use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use featsync::{
    append_source_records, log_app_start, Collector, CollectorConfig, ConnectionPool, FetchError,
    FetchOutcome, Granularity, LoggingConfig, Materializer, MaterializerConfig, RejectedRecord,
    RetryPolicy, SourceConfig, SourceFetcher, SourceId, SourceRecord, SymbolRegistry,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

const DAY_MS: i64 = 86_400_000;
const NOW: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

/// One onchain row per day plus one unparseable row per call.
struct NoisyOnchainFetcher;

impl SourceFetcher for NoisyOnchainFetcher {
    fn source(&self) -> SourceId {
        SourceId::Onchain
    }

    fn fetch(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<FetchOutcome, FetchError> {
        let mut outcome = FetchOutcome::default();
        let mut ts = (start_ms + DAY_MS - 1).div_euclid(DAY_MS) * DAY_MS;
        while ts < end_ms {
            outcome.records.push(SourceRecord {
                source: SourceId::Onchain,
                symbol: symbol.to_string(),
                ts_ms_utc: ts,
                values: vec![880_000.0, 390_000.0, 410.0],
            });
            ts += DAY_MS;
        }
        outcome.rejected.push(RejectedRecord {
            reason: "missing tx_count".to_string(),
        });
        Ok(outcome)
    }
}

#[test]
fn collector_cycle_emits_gap_and_backfill_events() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let pool = ConnectionPool::open(&temp.path().join("logs.sqlite"), 1).expect("pool should open");
    let registry = SymbolRegistry::new(["BTC"]);
    {
        let conn = pool.get().expect("connection should be available");
        let stale = SourceRecord {
            source: SourceId::Onchain,
            symbol: "BTC".to_string(),
            ts_ms_utc: NOW - 400 * DAY_MS,
            values: vec![1.0, 2.0, 3.0],
        };
        append_source_records(&conn, SourceId::Onchain, &[stale], 0).expect("seed should insert");
    }

    let fetcher = NoisyOnchainFetcher;
    let logs = capture_logs(Level::INFO, || {
        let mut collector = Collector::new(
            &pool,
            &registry,
            SourceConfig::with_defaults(SourceId::Onchain, Granularity::Daily),
            CollectorConfig::default(),
            0,
            &fetcher,
        )
        .expect("collector should build");
        let report = collector.run_cycle(NOW).expect("cycle should complete");
        assert!(report.failed_symbols().is_empty());
    });

    assert!(logs.contains("\"event\":\"collector.gap_detected\""));
    assert!(logs.contains("\"event\":\"collector.gap_clipped\""));
    assert!(logs.contains("\"event\":\"collector.backfill_started\""));
    assert!(logs.contains("\"event\":\"collector.backfill_completed\""));
    assert!(logs.contains("\"event\":\"collector.record_dropped\""));
    assert!(logs.contains("missing tx_count"));
}

#[test]
fn deferred_symbols_emit_skip_events() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let pool = ConnectionPool::open(&temp.path().join("logs.sqlite"), 2).expect("pool should open");
    let registry = SymbolRegistry::new(["BTC", "ETH"]);
    {
        let conn = pool.get().expect("connection should be available");
        let rows: Vec<SourceRecord> = ["BTC", "ETH"]
            .iter()
            .map(|symbol| SourceRecord {
                source: SourceId::Price,
                symbol: symbol.to_string(),
                ts_ms_utc: NOW,
                values: vec![1.0, 2.0, 0.5, 1.5, 10.0],
            })
            .collect();
        append_source_records(&conn, SourceId::Price, &rows, 0).expect("seed should insert");
    }

    let sources = [SourceConfig::with_defaults(SourceId::Price, Granularity::SubHourly)];
    let cfg = MaterializerConfig {
        deadline_ms: 0,
        lock_retry: RetryPolicy {
            max_retries: 0,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        ..MaterializerConfig::default()
    };

    let logs = capture_logs(Level::INFO, || {
        let report = Materializer::new(&pool, &registry, &sources, cfg)
            .expect("materializer should build")
            .run_cycle(NOW)
            .expect("cycle should complete");
        assert_eq!(report.deferred.len(), 2);
    });

    assert!(logs.contains("\"event\":\"materializer.cycle.start\""));
    assert!(logs.contains("\"event\":\"materializer.symbol_skipped\""));
    assert!(logs.contains("\"event\":\"materializer.cycle.finish\""));
}

#[test]
fn app_start_helper_emits_baseline_event() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start("feature_pipeline", &LoggingConfig::default());
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"component\":\"feature_pipeline\""));
}
