// crates/server-jobs/src/runner.rs
//! The driving task: one per job, sole writer of its status and percent.

use std::sync::Arc;

use copyrem_core::{ProcessError, ProgressSink, Transform};
use tokio::task::JoinHandle;

use crate::registry::{remove_artifact, JobRegistry};
use crate::types::{JobHandle, JobKind};

/// Message stored when a transform exits cleanly but an output is absent.
pub const NO_OUTPUT_MESSAGE: &str = "processing produced no output";

/// Run `transform` in the background and record its outcome in `registry`.
///
/// Process diagnostics are logged here and never stored on the job; clients
/// only ever see the generic failure message for the job kind.
pub fn spawn_job(
    registry: Arc<JobRegistry>,
    handle: JobHandle,
    transform: Box<dyn Transform>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let JobHandle {
            id,
            kind,
            outputs,
            cancel,
        } = handle;
        registry.set_running(&id);

        let sink: ProgressSink = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            Arc::new(move |pct| registry.set_percent(&id, pct))
        };

        let outcome = transform.run(cancel.clone(), sink).await;

        if cancel.is_cancelled() {
            // The registry dropped the job before the process was reaped, so
            // any output present now was written after the discard.
            for path in outputs.paths() {
                remove_artifact(&id, path);
            }
            match &outcome {
                Err(e) if !e.is_cancelled() => {
                    tracing::debug!(job_id = %id, kind = transform.kind(), error = %e, "transform errored after cancellation")
                }
                _ => tracing::debug!(job_id = %id, kind = transform.kind(), "job stopped after cancellation"),
            }
            return;
        }
        registry.release_input(&id);

        match outcome {
            Ok(()) => registry.set_done(&id),
            Err(e) => {
                tracing::warn!(job_id = %id, kind = transform.kind(), error = %e, "transform failed");
                registry.set_failed(&id, failure_message(kind, &e));
            }
        }
    })
}

fn failure_message(kind: JobKind, error: &ProcessError) -> &'static str {
    match error {
        ProcessError::OutputMissing(_) => NO_OUTPUT_MESSAGE,
        _ => kind.failure_message(),
    }
}
