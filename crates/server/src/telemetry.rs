//! Tracing and metrics bootstrap helpers for the scaffolding that hosts the
//! discovery core.

use std::str::FromStr;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bounds for `stream_send_duration_seconds`.
const SEND_DURATION_BUCKETS: &[f64] = &[0.001, 0.01, 0.1, 1.0, 5.0];

pub fn init_tracing() {
    let env = std::env::var("TRELLIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Installs the process-wide Prometheus recorder and returns the handle the
/// scaffolding serves scrapes from.
pub fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("stream_send_duration_seconds".to_string()),
            SEND_DURATION_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}
