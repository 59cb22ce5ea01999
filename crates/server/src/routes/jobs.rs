// crates/server/src/routes/jobs.rs
//! Handlers shared by the convert and separate route families.
//!
//! Each family only sees jobs of its own kind: an id created by `/convert`
//! is unknown to `/separate/...` and vice versa.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::Multipart,
    http::{header, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use copyrem_server_jobs::{
    progress_events, spawn_job, JobId, JobKind, JobOutputs, NewJob, Stem,
};
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::upload::{random_hex, save_upload};

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct CreatedJob {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct Cancelled {
    pub cancelled: bool,
}

/// Save the upload, register the job and start its driving task.
pub async fn create(
    state: &Arc<AppState>,
    kind: JobKind,
    multipart: Multipart,
) -> ApiResult<Json<CreatedJob>> {
    let upload = save_upload(multipart, &state.config.upload, &state.scratch_dir).await?;

    let base = random_hex(8);
    let outputs = match kind {
        JobKind::Convert => JobOutputs::Single(state.scratch_dir.join(format!("{base}.mp3"))),
        JobKind::Separate => JobOutputs::Stems {
            vocals: state.scratch_dir.join(format!("{base}_vocals.mp3")),
            instrumental: state.scratch_dir.join(format!("{base}_instrumental.mp3")),
        },
    };
    let transform = match &outputs {
        JobOutputs::Single(output) => state.transforms.convert(&upload.path, output),
        JobOutputs::Stems {
            vocals,
            instrumental,
        } => state
            .transforms
            .separate(&upload.path, vocals, instrumental),
    };

    let handle = state.jobs.create(NewJob {
        input: upload.path,
        outputs,
        display_name: upload.display_name,
    });
    let job_id = handle.id.to_string();
    tracing::info!(job_id = %job_id, kind = kind.as_str(), "job accepted");
    spawn_job(Arc::clone(&state.jobs), handle, transform);

    Ok(Json(CreatedJob { job_id }))
}

fn require_kind(state: &AppState, id: &JobId, kind: JobKind) -> ApiResult<()> {
    match state.jobs.get(id) {
        Some(job) if job.kind == kind => Ok(()),
        _ => Err(ApiError::NotFound(id.to_string())),
    }
}

/// SSE progress for one job. Unknown ids are rejected before streaming.
pub fn progress(
    state: &Arc<AppState>,
    kind: JobKind,
    id: String,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let id = JobId::from(id);
    require_kind(state, &id, kind)?;

    let poll = state.config.jobs.progress_poll();
    let stream = progress_events(Arc::clone(&state.jobs), id, poll)
    .map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(json))
    });

    // A job with no measurable progress emits nothing, so the keep-alive
    // write is what surfaces a closed connection.
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(poll)))
}

pub fn cancel(state: &AppState, kind: JobKind, id: String) -> ApiResult<Json<Cancelled>> {
    let id = JobId::from(id);
    require_kind(state, &id, kind)?;
    if !state.jobs.cancel(&id) {
        return Err(ApiError::NotFound(id.to_string()));
    }
    tracing::info!(job_id = %id, "job cancelled by client");
    Ok(Json(Cancelled { cancelled: true }))
}

/// Stream a finished output as an `audio/mpeg` attachment.
pub fn download(
    state: &AppState,
    kind: JobKind,
    id: String,
    stem: Option<Stem>,
) -> ApiResult<Response> {
    let id = JobId::from(id);
    require_kind(state, &id, kind)?;

    let opened = state
        .jobs
        .open_output(&id, stem)
        .map_err(|e| ApiError::from_registry(id.as_str(), e))?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        opened.file_name
    ))
    .map_err(|e| ApiError::Internal(format!("bad download name: {e}")))?;
    let body = Body::from_stream(ReaderStream::new(tokio::fs::File::from_std(opened.file)));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("audio/mpeg")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(opened.len)),
        ],
        body,
    )
        .into_response())
}
