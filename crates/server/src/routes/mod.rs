//! HTTP route handlers for the copyrem server.

pub mod convert;
pub mod health;
pub mod info;
pub mod jobs;
pub mod separate;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Create the combined router.
///
/// Routes:
/// - POST /convert, POST /separate - Upload and start a job (rate-limited)
/// - GET  /convert/progress/{id}, /separate/progress/{id} - SSE progress
/// - POST /convert/cancel/{id}, /separate/cancel/{id} - Cancel and discard
/// - GET  /convert/download/{id} - One-shot MP3 download
/// - GET  /separate/download/{id}/{stem} - Stem download (vocals, instrumental)
/// - GET  /api/info - Upload limits
/// - GET  /api/health - Health check
/// - GET  /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(convert::router(&state))
        .merge(separate::router(&state))
        .nest("/api", info::router())
        .nest("/api", health::router())
        .route("/metrics", get(crate::metrics::scrape))
        .with_state(state)
}
