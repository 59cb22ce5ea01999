// crates/server/src/state.rs
//! Application state for the Axum server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use copyrem_core::{AppConfig, ExternalTools, TransformFactory};
use copyrem_server_jobs::JobRegistry;

use crate::rate_limit::RateLimiter;

/// Shared application state accessible from all route handlers.
///
/// Registry and limiter are constructed here, once per server, and reach
/// handlers only through this state.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: AppConfig,
    /// Where uploads and job outputs are written.
    pub scratch_dir: PathBuf,
    pub jobs: Arc<JobRegistry>,
    /// Admission control for job creation.
    pub limiter: Arc<RateLimiter>,
    /// Builds the transform each admitted job runs.
    pub transforms: Arc<dyn TransformFactory>,
}

impl AppState {
    /// Production state: ffmpeg/demucs transforms, scratch dir from config.
    pub fn new(config: AppConfig) -> Arc<Self> {
        let transforms = Arc::new(ExternalTools::new(config.params.clone()));
        let scratch_dir = config.jobs.scratch_dir();
        Self::with_transforms(config, scratch_dir, transforms)
    }

    /// Create with an explicit scratch dir and transform factory (for tests).
    pub fn with_transforms(
        config: AppConfig,
        scratch_dir: PathBuf,
        transforms: Arc<dyn TransformFactory>,
    ) -> Arc<Self> {
        let jobs = Arc::new(JobRegistry::new(config.jobs.ttl()));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.burst,
            config.rate_limit.window(),
        ));
        Arc::new(Self {
            start_time: Instant::now(),
            config,
            scratch_dir,
            jobs,
            limiter,
            transforms,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
