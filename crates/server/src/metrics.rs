//! Application metrics for Prometheus monitoring.
//!
//! The job registry and the rate-limit middleware record through the global
//! `metrics` facade; this module installs the Prometheus recorder behind it
//! and serves the scrape output at `GET /metrics`.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Call once at startup, before any metrics are recorded.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    let mut installed = false;
    // Concurrent callers block here until the first one has stored the handle.
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Failed to set global metrics recorder (already set)");
        } else {
            describe_metrics();
            installed = true;
        }
        handle
    });

    if installed {
        tracing::info!("Prometheus metrics initialized");
    }
    installed
}

fn describe_metrics() {
    describe_counter!("jobs_created_total", "Jobs admitted, by kind");
    describe_counter!(
        "jobs_finished_total",
        "Jobs that left the running state, by outcome (done, failed, cancelled, expired)"
    );
    describe_gauge!("jobs_active", "Job records currently held by the registry");
    describe_counter!(
        "rate_limit_rejections_total",
        "Job-creation requests rejected by admission control"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Scrape handler. 503 until `init_metrics` has run.
pub async fn scrape() -> Response {
    let Some(body) = render_metrics() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response();
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_init() {
        // Another test may have installed the recorder first.
        init_metrics();
        metrics::counter!("rate_limit_rejections_total").increment(1);
        let output = render_metrics().unwrap();
        assert!(output.contains("rate_limit_rejections_total"));
        assert!(!init_metrics());
    }

    #[tokio::test]
    async fn test_scrape_serves_described_job_metrics() {
        init_metrics();
        metrics::gauge!("jobs_active").set(3.0);

        let response = scrape().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# HELP jobs_active"));
    }
}
