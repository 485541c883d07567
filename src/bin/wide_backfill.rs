//! Manually invoked backfill over an explicit range, ignoring the per-source
//! backfill ceiling. Used to recover gaps the scheduled collector clipped.
//!
//! Usage: `wide_backfill <source> <symbol> <start YYYY-MM-DD> [end YYYY-MM-DD]`

use chrono::{NaiveDate, Utc};
use featsync::{
    build_fetcher, day_start_ms, init_logging, log_app_start, logging_config_from_env,
    pipeline_config_from_env, BackfillPlan, Collector, ConnectionPool, SourceId,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("wide_backfill", &logging_cfg);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args.len() > 4 {
        return Err(
            "usage: wide_backfill <source> <symbol> <start YYYY-MM-DD> [end YYYY-MM-DD]".into(),
        );
    }

    let config = pipeline_config_from_env()?;
    let source = SourceId::parse(&args[0]).ok_or_else(|| format!("unknown source '{}'", args[0]))?;
    let source_cfg = *config
        .source(source)
        .ok_or_else(|| format!("source '{}' is not configured", source.as_str()))?;
    let symbol = config
        .registry
        .canonicalize(&args[1])
        .ok_or_else(|| format!("symbol '{}' is not tracked", args[1]))?
        .to_string();

    let now_ms = Utc::now().timestamp_millis();
    let start_ms = day_start_ms(parse_date(&args[2])?)?;
    let end_ms = match args.get(3) {
        Some(raw) => day_start_ms(parse_date(raw)?)?.min(now_ms),
        None => now_ms,
    };
    if end_ms <= start_ms {
        return Err(format!("invalid range: start={} end={}", args[2], end_ms).into());
    }

    let fetcher = build_fetcher(&config, source)?
        .ok_or_else(|| format!("no fetcher configured for '{}'", source.as_str()))?;
    let pool = ConnectionPool::open(&config.db_path, 1)?;
    let collector = Collector::new(
        &pool,
        &config.registry,
        source_cfg,
        config.collector.clone(),
        config.epoch_floor_ms,
        fetcher.as_ref(),
    )?;

    let plan = BackfillPlan {
        source,
        symbol: symbol.clone(),
        start_ms,
        end_ms,
        unrecoverable: None,
    };
    println!(
        "Backfilling {} {} from {} to {} in {} chunks",
        source.as_str(),
        symbol,
        args[2],
        args.get(3).map(String::as_str).unwrap_or("now"),
        plan.chunks(config.collector.backfill_chunk_ms).len()
    );

    let report = collector.run_backfill(&plan, now_ms)?;
    println!(
        "RESULT: chunks_committed={} rows_inserted={} rows_dropped={}",
        report.chunks_committed, report.rows_inserted, report.rows_dropped
    );
    match report.failure {
        Some(reason) => Err(format!("backfill stopped early: {reason}").into()),
        None => Ok(()),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|err| format!("invalid date '{raw}': {err}"))
}
