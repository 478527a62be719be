use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "scoring_resolutions_total",
        "Forecasts resolved, by event type and result."
    );
    describe_counter!(
        "scoring_resolutions_failed_total",
        "Resolution attempts rejected or failed, by reason."
    );
    describe_counter!(
        "scoring_points_awarded_total",
        "Points awarded across all resolutions."
    );
    describe_counter!(
        "scoring_cache_requests_total",
        "Leaderboard cache lookups, by hit or miss."
    );
    describe_counter!(
        "scoring_cache_errors_total",
        "Cache calls that failed or timed out and fell back to the store."
    );
    describe_counter!(
        "scoring_leaderboard_pages_computed_total",
        "Leaderboard pages computed from the store."
    );
    describe_counter!(
        "scoring_sweep_resolved_total",
        "Forecasts resolved as expired by the sweeper."
    );
    describe_counter!(
        "scoring_sweep_errors_total",
        "Per-forecast failures during expiry sweeps."
    );
    describe_counter!(
        "scoring_events_published_total",
        "Result events handed to bus subscribers."
    );
    describe_histogram!(
        "scoring_db_query_latency_ms",
        "SQLite call latency in milliseconds, by operation."
    );
    describe_counter!(
        "scoring_db_query_errors_total",
        "SQLite calls that returned an error, by operation."
    );
    describe_counter!(
        "scoring_db_query_timeouts_total",
        "Read-path SQLite calls abandoned after the query timeout."
    );
    describe_counter!(
        "tracing_error_events",
        "ERROR-level log events."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
