// crates/core/src/separator.rs
//! Two-stem source separation through demucs.
//!
//! demucs has no progress channel, so the run is reported with the
//! `HeuristicRamp::SEPARATION` estimate. The remaining range belongs to the
//! two MP3 re-encodes, which report fixed checkpoints.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::ffmpeg::{encode_mp3_args, ffmpeg_binary, resolve_in_path};
use crate::process::{
    run_to_completion, run_with_ramp, HeuristicRamp, ProcessError, Progress, ProgressSink,
};
use crate::transform::{ensure_output, Transform};

pub const DEMUCS_NOT_FOUND: &str =
    "demucs not found: pip install demucs, then ensure demucs or python -m demucs is on PATH";

const VOCALS_STEM: &str = "vocals.wav";
const NO_VOCALS_STEM: &str = "no_vocals.wav";

const RAMP_TICK: Duration = Duration::from_secs(2);
const STARTED: u8 = 5;
const STEMS_FOUND: u8 = 75;
const VOCALS_ENCODED: u8 = 87;

/// How to invoke demucs: the program plus any leading arguments
/// (`-m demucs` for the python fallback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemucsCommand {
    pub program: PathBuf,
    pub prefix: Vec<OsString>,
}

impl DemucsCommand {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix);
        cmd
    }
}

/// `demucs` on `path_var`, else `python3 -m demucs`, else `python -m demucs`.
pub fn find_demucs(path_var: &OsStr) -> Option<DemucsCommand> {
    if let Some(program) = resolve_in_path("demucs", path_var) {
        return Some(DemucsCommand {
            program,
            prefix: Vec::new(),
        });
    }
    ["python3", "python"]
        .iter()
        .find_map(|py| resolve_in_path(py, path_var))
        .map(|program| DemucsCommand {
            program,
            prefix: vec!["-m".into(), "demucs".into()],
        })
}

pub fn demucs_available() -> bool {
    std::env::var_os("PATH").is_some_and(|path| find_demucs(&path).is_some())
}

/// `<input dir>/<input stem>_demucs_out`
pub fn scratch_dir_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}_demucs_out"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemPaths {
    pub vocals: PathBuf,
    pub no_vocals: PathBuf,
}

/// Locate the two stems anywhere below `out_dir`. demucs nests them under
/// `<model>/<track>/`, and both names vary by version.
pub fn find_stem_paths(out_dir: &Path) -> Result<StemPaths, ProcessError> {
    let mut vocals = None;
    let mut no_vocals = None;
    for entry in WalkDir::new(out_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        match entry.file_name().to_str() {
            Some(VOCALS_STEM) => vocals = Some(entry.into_path()),
            Some(NO_VOCALS_STEM) => no_vocals = Some(entry.into_path()),
            _ => {}
        }
    }
    match (vocals, no_vocals) {
        (Some(vocals), Some(no_vocals)) => Ok(StemPaths { vocals, no_vocals }),
        _ => Err(ProcessError::OutputMissing(format!(
            "expected {VOCALS_STEM} and {NO_VOCALS_STEM} from demucs"
        ))),
    }
}

/// Removes the demucs output tree when dropped, on every exit path.
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "failed to remove demucs scratch dir"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeparateTransform {
    input: PathBuf,
    vocals: PathBuf,
    instrumental: PathBuf,
    search_path: Option<OsString>,
}

impl SeparateTransform {
    pub fn new(input: &Path, vocals: &Path, instrumental: &Path) -> Self {
        Self {
            input: input.to_path_buf(),
            vocals: vocals.to_path_buf(),
            instrumental: instrumental.to_path_buf(),
            search_path: None,
        }
    }

    /// Resolve demucs against `path_var` instead of the process `PATH`.
    pub fn with_search_path(mut self, path_var: impl Into<OsString>) -> Self {
        self.search_path = Some(path_var.into());
        self
    }

    fn locate_demucs(&self) -> Option<DemucsCommand> {
        let path_var = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))?;
        find_demucs(&path_var)
    }
}

#[async_trait]
impl Transform for SeparateTransform {
    fn kind(&self) -> &'static str {
        "separate"
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        sink: ProgressSink,
    ) -> Result<(), ProcessError> {
        let demucs = self
            .locate_demucs()
            .ok_or_else(|| ProcessError::launch("demucs", DEMUCS_NOT_FOUND))?;
        let mut progress = Progress::new(sink);

        let out_dir = scratch_dir_for(&self.input);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| ProcessError::launch("demucs", format!("scratch dir: {e}")))?;
        let _scratch = ScratchDir(out_dir.clone());

        progress.checkpoint(STARTED);
        let mut cmd = demucs.command();
        cmd.arg("--two-stems=vocals").arg("-o").arg(&out_dir).arg(&self.input);
        let ramp = HeuristicRamp::SEPARATION;
        run_with_ramp(cmd, &cancel, ramp, RAMP_TICK, &mut progress).await?;
        progress.checkpoint(ramp.cap);

        let stems = find_stem_paths(&out_dir)?;
        progress.checkpoint(STEMS_FOUND);

        let ffmpeg = ffmpeg_binary();
        encode_stem(&ffmpeg, &stems.vocals, &self.vocals, &cancel).await?;
        progress.checkpoint(VOCALS_ENCODED);
        encode_stem(&ffmpeg, &stems.no_vocals, &self.instrumental, &cancel).await?;

        progress.complete();
        Ok(())
    }
}

async fn encode_stem(
    ffmpeg: &Path,
    wav: &Path,
    mp3: &Path,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(encode_mp3_args(wav, mp3));
    run_to_completion(cmd, cancel).await?;
    ensure_output(mp3).await
}
