// crates/server-jobs/src/lib.rs
//! Asynchronous job orchestration for audio transforms.
//!
//! Provides:
//! - `JobRegistry`: single source of truth for job state, cancellation and expiry
//! - `spawn_job`: the driving task that runs a `Transform` and records its outcome
//! - `spawn_janitor`: periodic TTL sweep
//! - `progress_events`: polling progress stream with disconnect-cancels semantics

pub mod janitor;
pub mod registry;
pub mod runner;
pub mod stream;
pub mod types;

pub use janitor::spawn_janitor;
pub use registry::{JobRegistry, OpenedOutput, RegistryError};
pub use runner::spawn_job;
pub use stream::{progress_events, ProgressEvent};
pub use types::{
    download_name, JobHandle, JobId, JobKind, JobOutputs, JobSnapshot, JobStatus, NewJob, Stem,
    UnknownStem, CONVERT_SUFFIX,
};
