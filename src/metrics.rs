//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder
/// Returns a handle that can be used to render the collected metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record one artifact file persisted to the cache
pub fn record_artifact_downloaded(model_id: &str, bytes: usize) {
    metrics::counter!("lmm_artifact_files_downloaded_total",
        "model" => model_id.to_string()
    )
    .increment(1);
    metrics::counter!("lmm_artifact_bytes_downloaded_total",
        "model" => model_id.to_string()
    )
    .increment(bytes as u64);
}

/// Record a signed-manifest refresh after a slow download
pub fn record_manifest_refresh(model_id: &str) {
    metrics::counter!("lmm_manifest_refreshes_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a completed composition
pub fn record_composition(family: &str, seconds: f64) {
    metrics::histogram!("lmm_composition_duration_seconds",
        "family" => family.to_string()
    )
    .record(seconds);
}

/// Record the tokens one generation call hands to the decoder
pub fn record_generation(family: &str, tokens: usize) {
    metrics::counter!("lmm_generated_tokens_total",
        "family" => family.to_string()
    )
    .increment(tokens as u64);
}
