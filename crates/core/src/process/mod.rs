//! Supervision of external long-running processes.
//!
//! Provides:
//! - `ProcessError`: the failure taxonomy returned by every supervised run
//! - `Progress`: monotonic, rate-limited percent reporting
//! - `HeuristicRamp`: time-based estimate for tools without a progress channel
//! - `supervisor`: spawn / wait / kill-on-cancel for `tokio::process::Command`

pub mod progress;
pub mod supervisor;

use std::sync::Arc;

use thiserror::Error;

pub use progress::{exact_percent, parse_out_time_us, HeuristicRamp, Progress, ProgressThrottle};
pub use supervisor::{run_to_completion, run_with_exact_progress, run_with_ramp};

/// Callback receiving percent updates (0..=100).
///
/// Invoked from the supervising task; implementations must not block.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// Outcome of a supervised operation that did not succeed.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("{program} exited with {status}: {diagnostics}", status = exit_code_label(*.code))]
    ExitedNonZero {
        program: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("expected output missing: {0}")]
    OutputMissing(String),
}

impl ProcessError {
    pub fn launch(program: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::LaunchFailed {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn exit_code_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
