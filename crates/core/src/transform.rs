//! The transformation collaborator seen by the job layer.
//!
//! A `Transform` is one opaque, cancellable, long-running operation that
//! writes its outputs to paths fixed at construction. The job layer never
//! looks inside; it only forwards a cancellation token and a progress sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::Params;
use crate::ffmpeg::{convert_args, ffmpeg_binary, probe_binary, probe_duration};
use crate::process::{
    run_to_completion, run_with_exact_progress, ProcessError, Progress, ProgressSink,
};
use crate::separator::SeparateTransform;

#[async_trait]
pub trait Transform: Send + Sync {
    /// Short label used in logs.
    fn kind(&self) -> &'static str;

    /// Run to completion. Reports 100 through `progress` only on success.
    async fn run(&self, cancel: CancellationToken, progress: ProgressSink)
        -> Result<(), ProcessError>;
}

/// Builds transforms for freshly admitted jobs.
///
/// The server holds one of these; tests substitute fakes.
pub trait TransformFactory: Send + Sync {
    fn convert(&self, input: &Path, output: &Path) -> Box<dyn Transform>;

    fn separate(&self, input: &Path, vocals: &Path, instrumental: &Path) -> Box<dyn Transform>;
}

/// Production factory backed by ffmpeg and demucs.
#[derive(Debug, Clone, Default)]
pub struct ExternalTools {
    params: Params,
}

impl ExternalTools {
    pub fn new(params: Params) -> Self {
        Self { params }
    }
}

impl TransformFactory for ExternalTools {
    fn convert(&self, input: &Path, output: &Path) -> Box<dyn Transform> {
        Box::new(ConvertTransform::new(self.params.clone(), input, output))
    }

    fn separate(&self, input: &Path, vocals: &Path, instrumental: &Path) -> Box<dyn Transform> {
        Box::new(SeparateTransform::new(input, vocals, instrumental))
    }
}

/// Single-pass ffmpeg re-encode with exact progress.
#[derive(Debug, Clone)]
pub struct ConvertTransform {
    params: Params,
    input: PathBuf,
    output: PathBuf,
}

impl ConvertTransform {
    pub fn new(params: Params, input: &Path, output: &Path) -> Self {
        Self {
            params,
            input: input.to_path_buf(),
            output: output.to_path_buf(),
        }
    }
}

#[async_trait]
impl Transform for ConvertTransform {
    fn kind(&self) -> &'static str {
        "convert"
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        sink: ProgressSink,
    ) -> Result<(), ProcessError> {
        let ffmpeg = ffmpeg_binary();
        let ffprobe = probe_binary(&ffmpeg);
        let mut progress = Progress::new(sink);

        let total = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
            total = probe_duration(&ffprobe, &self.input) => total,
        };

        let mut cmd = Command::new(&ffmpeg);
        match total {
            Some(total) => {
                cmd.args(convert_args(&self.params, &self.input, &self.output, true));
                run_with_exact_progress(cmd, &cancel, total, &mut progress).await?;
            }
            None => {
                tracing::debug!(input = %self.input.display(), "duration unknown, converting without progress");
                cmd.args(convert_args(&self.params, &self.input, &self.output, false));
                run_to_completion(cmd, &cancel).await?;
            }
        }

        ensure_output(&self.output).await?;
        progress.complete();
        Ok(())
    }
}

/// Fail with `OutputMissing` unless `path` exists after a successful exit.
pub(crate) async fn ensure_output(path: &Path) -> Result<(), ProcessError> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        _ => Err(ProcessError::OutputMissing(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )),
    }
}
