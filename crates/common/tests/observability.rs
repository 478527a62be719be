use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn error_events_are_counted_and_lower_levels_are_not() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, otel_guard) = common::observability::build_dispatch("scoring-test", "info");
        // No OTLP endpoint in tests.
        assert!(otel_guard.is_none());

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::warn!(forecast_id = 7, "cache unavailable");
        });
    });
    assert!(!handle.render().contains("tracing_error_events"));

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, _otel_guard) = common::observability::build_dispatch("scoring-test", "info");
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(forecast_id = 7, "resolution failed");
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("tracing_error_events"),
        "expected tracing_error_events in rendered metrics, got:\n{rendered}"
    );
}
