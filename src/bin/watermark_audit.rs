use chrono::{TimeZone, Utc};
use featsync::{
    build_feature_schema, count_feature_records, detect_gap, max_source_ts, pipeline_config_from_env,
    plan_backfill, read_watermark, ConnectionPool, WatermarkScope,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = pipeline_config_from_env()?;
    let pool = ConnectionPool::open(&config.db_path, 1)?;
    let conn = pool.get()?;
    let now_ms = Utc::now().timestamp_millis();
    let schema = build_feature_schema();

    println!(
        "Watermark audit for {} at {} (schema v{} {})",
        config.db_path.display(),
        fmt_ts(Some(now_ms)),
        schema.version,
        &schema.fingerprint[..12]
    );
    println!("feature records: {}", count_feature_records(&conn)?);

    let mut owed = 0usize;
    let mut clipped = 0usize;
    for source_cfg in &config.sources {
        println!(
            "\n{} ({}, refresh={}s, window={}s)",
            source_cfg.source.as_str(),
            source_cfg.granularity.as_str(),
            source_cfg.refresh_interval_secs,
            source_cfg.max_backfill_window_secs
        );

        for symbol in config.registry.symbols() {
            let last_row = max_source_ts(&conn, source_cfg.source, symbol)?;
            let collected = read_watermark(&conn, symbol, source_cfg.source, WatermarkScope::Collected)?;
            let materialized =
                read_watermark(&conn, symbol, source_cfg.source, WatermarkScope::Materialized)?;
            let gap = detect_gap(&conn, source_cfg, symbol, now_ms, config.epoch_floor_ms)?;

            let status = match &gap {
                None => "ok".to_string(),
                Some(gap) => {
                    owed += 1;
                    let plan = plan_backfill(gap, source_cfg);
                    match plan.unrecoverable {
                        Some((start, end)) => {
                            clipped += 1;
                            format!(
                                "backfill owed from {} (unrecoverable {} -> {})",
                                fmt_ts(Some(plan.start_ms)),
                                fmt_ts(Some(start)),
                                fmt_ts(Some(end))
                            )
                        }
                        None => format!("backfill owed from {}", fmt_ts(Some(plan.start_ms))),
                    }
                }
            };

            println!(
                "  {:<8} last_row={} collected={} materialized={} | {}",
                symbol,
                fmt_ts(last_row),
                fmt_ts(collected),
                fmt_ts(materialized),
                status
            );
        }
    }

    println!("\nRESULT: backfills_owed={owed} clipped_gaps={clipped}");
    Ok(())
}

fn fmt_ts(ts_ms: Option<i64>) -> String {
    ts_ms
        .and_then(|ts| Utc.timestamp_millis_opt(ts).single())
        .map(|dt| dt.format("%Y-%m-%dT%H:%MZ").to_string())
        .unwrap_or_else(|| "-".to_string())
}
