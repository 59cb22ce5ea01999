// crates/server/src/routes/convert.rs
//! Single-output conversion jobs.
//!
//! - POST /convert: upload (multipart `file`), returns `{"job_id"}`
//! - GET /convert/progress/{id}: SSE progress
//! - POST /convert/cancel/{id}
//! - GET /convert/download/{id}: one-shot download of the MP3

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use copyrem_server_jobs::JobKind;

use super::jobs::{self, CreatedJob};
use crate::error::ApiResult;
use crate::rate_limit::limit_job_creation;
use crate::state::AppState;

async fn create_job(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<CreatedJob>> {
    jobs::create(&state, JobKind::Convert, multipart).await
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    jobs::progress(&state, JobKind::Convert, id)
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<jobs::Cancelled>> {
    jobs::cancel(&state, JobKind::Convert, id)
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    jobs::download(&state, JobKind::Convert, id, None)
}

/// Build the convert router. Creation is rate-limited and body-capped.
pub fn router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let create = Router::new()
        .route("/convert", post(create_job))
        .layer(DefaultBodyLimit::max(state.config.upload.max_upload_bytes()))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(state),
            limit_job_creation,
        ));

    Router::new()
        .route("/convert/progress/{id}", get(progress))
        .route("/convert/cancel/{id}", post(cancel))
        .route("/convert/download/{id}", get(download))
        .merge(create)
}
