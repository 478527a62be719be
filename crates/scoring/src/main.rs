use anyhow::Result;
use scoring::cache::MemoryCache;
use scoring::events::{self, ResultBus};
use scoring::{cli, metrics, scheduler, sweeper, EngineSettings, ScoringEngine};
use std::sync::Arc;
use tracing::Instrument;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("scoring", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let cache = Arc::new(MemoryCache::new(config.cache.max_entries));
    let bus = ResultBus::new(config.events.bus_capacity);
    let engine = ScoringEngine::new(db, cache, bus.clone(), EngineSettings::from_config(&config));

    if cmd != cli::Command::Run {
        return cli::run_command(&engine, cmd).await;
    }

    tracing::info!("scoring engine starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    tokio::spawn(events::spawn_logging_subscriber(bus));
    tracing::info!(capacity = config.events.bus_capacity, "result logging subscriber started");

    let (sweep_tx, mut sweep_rx) = tokio::sync::mpsc::channel::<()>(8);

    // Worker first, so an immediate first tick has a receiver.
    let sweep_worker = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while sweep_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = sweeper::SWEEP_JOB_NAME);
                let report = engine.run_expiry_sweep().instrument(span).await;
                if !report.errors.is_empty() {
                    tracing::error!(
                        failed = report.errors.len(),
                        "expiry sweep finished with failures"
                    );
                }
            }
        })
    };

    let ticker_handles = scheduler::start(vec![scheduler::JobSpec {
        name: sweeper::SWEEP_JOB_NAME.to_string(),
        interval: std::time::Duration::from_secs(config.sweeper.interval_secs),
        tick: sweep_tx,
        run_immediately: config.sweeper.run_immediately,
    }]);
    tracing::info!(
        interval_secs = config.sweeper.interval_secs,
        "expiry sweeper scheduled"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down; waiting up to 5s for an in-flight sweep");

    let grace = std::time::Duration::from_secs(5);
    if scheduler::drain(ticker_handles, sweep_worker, grace).await {
        tracing::info!("sweep worker stopped");
    } else {
        tracing::warn!("sweep still running after 5s; exiting");
    }

    Ok(())
}
