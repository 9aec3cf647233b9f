use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "evaluator_wallets_analyzed_total",
        "Number of wallets valued and stored for the active window."
    );
    describe_counter!(
        "evaluator_rate_limits_total",
        "Number of provider rate limits hit, by provider."
    );
    describe_counter!(
        "evaluator_candidates_discovered_total",
        "Number of candidate wallets discovered by the spider."
    );
    describe_counter!(
        "evaluator_activity_events_total",
        "Number of swap activity rows stored."
    );
    describe_counter!(
        "evaluator_api_requests_total",
        "Number of API requests made."
    );
    describe_histogram!(
        "evaluator_api_latency_ms",
        "API request latency in milliseconds."
    );
    describe_histogram!(
        "evaluator_db_query_latency_ms",
        "SQLite query latency in milliseconds."
    );
}

/// Install the global recorder and serve `/metrics` on `port`. Must be called
/// from inside the tokio runtime.
pub fn install_prometheus(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}
