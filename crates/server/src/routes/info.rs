// crates/server/src/routes/info.rs
//! Upload limits for the frontend.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use copyrem_server_jobs::CONVERT_SUFFIX;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct InfoResponse {
    pub max_upload_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub download_suffix: String,
}

/// GET /api/info
pub async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let upload = &state.config.upload;
    Json(InfoResponse {
        max_upload_mb: upload.max_upload_mb,
        allowed_extensions: upload.allowed_extensions.clone(),
        download_suffix: CONVERT_SUFFIX.to_string(),
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/info", get(info))
}
