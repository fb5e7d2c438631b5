//! Metrics collection and Prometheus export.
//!
//! Initializes the metrics exporter and records captioning metrics. HTTP
//! request metrics come from `service_core::middleware::metrics_middleware`.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Panics if called more than once.
pub fn init_metrics() {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    if METRICS_HANDLE.set(handle).is_err() {
        panic!("failed to set metrics handle: already initialized");
    }
}

/// Get the current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// Outcome label for `caption_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionOutcome {
    Success,
    Rejected,
    DecodeError,
    InferenceError,
}

impl CaptionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptionOutcome::Success => "success",
            CaptionOutcome::Rejected => "rejected",
            CaptionOutcome::DecodeError => "decode_error",
            CaptionOutcome::InferenceError => "inference_error",
        }
    }
}

pub fn record_request(model: &str, outcome: CaptionOutcome) {
    counter!(
        "caption_requests_total",
        "model" => model.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_inference(model: &str, elapsed: Duration) {
    histogram!("caption_inference_duration_seconds", "model" => model.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_upload_size(bytes: usize) {
    histogram!("caption_upload_bytes").record(bytes as f64);
}
