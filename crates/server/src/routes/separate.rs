// crates/server/src/routes/separate.rs
//! Vocal/instrumental separation jobs.
//!
//! - POST /separate: upload (multipart `file`), returns `{"job_id"}`
//! - GET /separate/progress/{id}: SSE progress
//! - POST /separate/cancel/{id}
//! - GET /separate/download/{id}/{stem}: `vocals` or `instrumental`

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use copyrem_server_jobs::{JobKind, Stem};

use super::jobs::{self, CreatedJob};
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::limit_job_creation;
use crate::state::AppState;

async fn create_job(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<CreatedJob>> {
    jobs::create(&state, JobKind::Separate, multipart).await
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    jobs::progress(&state, JobKind::Separate, id)
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<jobs::Cancelled>> {
    jobs::cancel(&state, JobKind::Separate, id)
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path((id, stem)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    // Unknown stems read as an unknown download, same as a bad id.
    let stem: Stem = stem.parse().map_err(|_| ApiError::NotFound(id.clone()))?;
    jobs::download(&state, JobKind::Separate, id, Some(stem))
}

pub fn router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let create = Router::new()
        .route("/separate", post(create_job))
        .layer(DefaultBodyLimit::max(state.config.upload.max_upload_bytes()))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(state),
            limit_job_creation,
        ));

    Router::new()
        .route("/separate/progress/{id}", get(progress))
        .route("/separate/cancel/{id}", post(cancel))
        .route("/separate/download/{id}/{stem}", get(download))
        .merge(create)
}
