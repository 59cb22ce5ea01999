// crates/server-jobs/src/types.rs
//! Types for the job registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::RngCore;
use tokio_util::sync::CancellationToken;

/// Random bytes per job id (hex-encoded to twice as many characters).
pub const JOB_ID_BYTES: usize = 8;

/// Download suffix for single-output conversions.
pub const CONVERT_SUFFIX: &str = "_modified.mp3";

/// Opaque, unguessable job identifier.
///
/// Possession of an id grants download access, so ids are drawn from the
/// thread-local CSPRNG rather than a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; JOB_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a job. Cancelled jobs are removed, never marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Convert,
    Separate,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Separate => "separate",
        }
    }

    /// Generic message shown to clients when processing fails.
    pub fn failure_message(self) -> &'static str {
        match self {
            Self::Convert => "conversion failed",
            Self::Separate => "separation failed",
        }
    }
}

/// Output selector for separation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stem {
    Vocals,
    Instrumental,
}

impl Stem {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Vocals => "_vocals.mp3",
            Self::Instrumental => "_instrumental.mp3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stem: {0}")]
pub struct UnknownStem(pub String);

impl FromStr for Stem {
    type Err = UnknownStem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vocals" => Ok(Self::Vocals),
            "instrumental" => Ok(Self::Instrumental),
            other => Err(UnknownStem(other.to_string())),
        }
    }
}

/// Output locations owned by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutputs {
    Single(PathBuf),
    Stems {
        vocals: PathBuf,
        instrumental: PathBuf,
    },
}

impl JobOutputs {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Single(_) => JobKind::Convert,
            Self::Stems { .. } => JobKind::Separate,
        }
    }

    /// The file a download selector refers to. Single outputs take no
    /// selector; stems require one.
    pub fn select(&self, stem: Option<Stem>) -> Option<&Path> {
        match (self, stem) {
            (Self::Single(path), None) => Some(path),
            (Self::Stems { vocals, .. }, Some(Stem::Vocals)) => Some(vocals),
            (Self::Stems { instrumental, .. }, Some(Stem::Instrumental)) => Some(instrumental),
            _ => None,
        }
    }

    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Single(path) => vec![path.as_path()],
            Self::Stems {
                vocals,
                instrumental,
            } => vec![vocals.as_path(), instrumental.as_path()],
        }
    }
}

/// Admission request for `JobRegistry::create`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub input: PathBuf,
    pub outputs: JobOutputs,
    /// Already-sanitised base name for download filenames.
    pub display_name: String,
}

/// Returned by `create`: the id plus the job's cancellation capability,
/// handed to the driving task.
///
/// `outputs` lets the task remove files a process wrote after the registry
/// already discarded the job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
    pub outputs: JobOutputs,
    pub cancel: CancellationToken,
}

/// Read-only view of a job at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub percent: u8,
    pub error: Option<String>,
    pub display_name: String,
}

/// Suggested filename for a download.
pub fn download_name(display_name: &str, stem: Option<Stem>) -> String {
    match stem {
        Some(stem) => format!("{display_name}{}", stem.suffix()),
        None => format!("{display_name}{CONVERT_SUFFIX}"),
    }
}
