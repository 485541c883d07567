use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use featsync::{
    build_fetcher, init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env,
    Collector, ConnectionPool, Materializer, PipelineConfig,
};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

type TickError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_TICK_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("feature_pipeline", &logging_cfg);

    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    let tick_secs = std::env::var("FEATSYNC_TICK_SECS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TICK_SECS);

    let config = Arc::new(pipeline_config_from_env()?);
    let pool = Arc::new(ConnectionPool::open(
        &config.db_path,
        config.materializer.workers + 1,
    )?);

    info!(
        component = "feature_pipeline",
        event = "pipeline.configured",
        db_path = %config.db_path.display(),
        symbols = config.registry.len(),
        sources = config.sources.len(),
        tick_secs,
        once
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let config = Arc::clone(&config);
                let pool = Arc::clone(&pool);
                match tokio::task::spawn_blocking(move || run_tick(&config, &pool)).await? {
                    Ok(()) => {}
                    Err(err) => error!(
                        component = "feature_pipeline",
                        event = "pipeline.tick_failed",
                        error = %err
                    ),
                }
                if once {
                    break;
                }
            }
            _ = &mut shutdown => {
                info!(component = "feature_pipeline", event = "pipeline.shutdown");
                break;
            }
        }
    }

    Ok(())
}

/// One schedule tick: every configured collector, then one materializer
/// pass. A collector failure is logged and does not stop the others.
fn run_tick(config: &PipelineConfig, pool: &ConnectionPool) -> Result<(), TickError> {
    let now_ms = Utc::now().timestamp_millis();

    for source_cfg in &config.sources {
        let fetcher = match build_fetcher(config, source_cfg.source) {
            Ok(Some(fetcher)) => fetcher,
            Ok(None) => {
                warn!(
                    component = "feature_pipeline",
                    event = "pipeline.collector_unconfigured",
                    source = source_cfg.source.as_str()
                );
                continue;
            }
            Err(err) => {
                error!(
                    component = "feature_pipeline",
                    event = "pipeline.collector_failed",
                    source = source_cfg.source.as_str(),
                    error = %err
                );
                continue;
            }
        };

        let outcome = Collector::new(
            pool,
            &config.registry,
            *source_cfg,
            config.collector.clone(),
            config.epoch_floor_ms,
            fetcher.as_ref(),
        )
        .and_then(|mut collector| collector.run_cycle(now_ms));
        if let Err(err) = outcome {
            error!(
                component = "feature_pipeline",
                event = "pipeline.collector_failed",
                source = source_cfg.source.as_str(),
                error = %err
            );
        }
    }

    let materializer = Materializer::new(
        pool,
        &config.registry,
        &config.sources,
        config.materializer.clone(),
    )?;
    materializer.run_cycle(Utc::now().timestamp_millis())?;
    Ok(())
}
