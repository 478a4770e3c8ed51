use common::config::LogFormat;
use metrics_exporter_prometheus::PrometheusBuilder;

// Exercises the public `common::observability` surface rather than private layers.

#[test]
fn error_events_are_counted() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, _otel_guard) =
            common::observability::build_dispatch("insights-test", "info", LogFormat::Json);

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(insight_id = 7, "materialization failed");
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("insights_tracing_error_events"),
        "expected insights_tracing_error_events in rendered metrics, got:\n{rendered}"
    );
}

#[test]
fn pretty_format_builds_a_dispatcher() {
    let (dispatch, guard) =
        common::observability::build_dispatch("insights-test", "debug", LogFormat::Pretty);
    assert!(guard.is_none() || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok());
    tracing::dispatcher::with_default(&dispatch, || {
        tracing::info!("pretty logging works");
    });
}
