use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub const HTTP_REQUESTS_TOTAL: &str = "insights_http_requests_total";
pub const HTTP_LATENCY_MS: &str = "insights_http_latency_ms";

pub fn describe() {
    engine::metrics::describe();
    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "HTTP requests served, labelled by method and status."
    );
    describe_histogram!(
        HTTP_LATENCY_MS,
        "HTTP request latency in milliseconds."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

pub fn record_request(method: &str, status: u16, elapsed_ms: f64) {
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(HTTP_LATENCY_MS).record(elapsed_ms);
}
