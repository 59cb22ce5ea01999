// crates/core/src/config.rs
//! Application configuration.
//!
//! Loaded from an optional TOML file, then adjusted by a small set of
//! environment overrides (`TRUST_PROXY`, `CORS_ORIGINS`). Every section has
//! defaults, so an empty file and no file at all are both valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Parameters for the re-encode (pitch/tempo/resample) transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub tempo_factor: f64,
    pub pitch_semitones: f64,
    pub resample_rates: Vec<u32>,
    pub delay_left_ms: u32,
    pub delay_right_ms: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            bitrate: "320k".to_string(),
            sample_rate: 44_100,
            channels: 2,
            tempo_factor: 0.90,
            pitch_semitones: 0.25,
            resample_rates: vec![48_000, 96_000, 48_000],
            delay_left_ms: 1,
            delay_right_ms: 8,
        }
    }
}

/// Job registry lifetime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Hard lifetime of a job record, measured from creation.
    pub ttl_secs: u64,
    /// How often the janitor scans for expired jobs.
    pub sweep_interval_secs: u64,
    /// Poll cadence of progress subscriptions.
    pub progress_poll_ms: u64,
    /// Where uploads and outputs live. Defaults to the OS temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 30,
            progress_poll_ms: 500,
            scratch_dir: None,
        }
    }
}

impl JobsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn progress_poll(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Sliding-window admission control for job creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub burst: usize,
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
    /// Honour `X-Forwarded-For` when deriving the client key.
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            window_secs: 60,
            sweep_interval_secs: 300,
            trust_proxy: false,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_upload_mb: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: 80,
            allowed_extensions: [".mp3", ".m4a", ".wav", ".flac", ".aac", ".ogg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UploadConfig {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Case-insensitive check of an extension including its leading dot.
    pub fn is_allowed(&self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|e| *e == ext)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub params: Params,
    pub jobs: JobsConfig,
    pub rate_limit: RateLimitConfig,
    pub upload: UploadConfig,
    pub cors_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            params: Params::default(),
            jobs: JobsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upload: UploadConfig::default(),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (if given), apply environment
    /// overrides and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply environment-style overrides through `lookup`.
    ///
    /// - `TRUST_PROXY=1` enables forwarded-header client identity.
    /// - `CORS_ORIGINS` is a comma-separated list appended to the configured origins.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if lookup("TRUST_PROXY").as_deref() == Some("1") {
            self.rate_limit.trust_proxy = true;
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            for origin in origins.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                if !self.cors_origins.iter().any(|o| o == origin) {
                    self.cors_origins.push(origin.to_string());
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.rate_limit.burst == 0 {
            return invalid("rate_limit.burst must be at least 1");
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.sweep_interval_secs == 0 {
            return invalid("rate_limit windows must be non-zero");
        }
        if self.jobs.ttl_secs == 0 || self.jobs.sweep_interval_secs == 0 {
            return invalid("jobs.ttl_secs and jobs.sweep_interval_secs must be non-zero");
        }
        if self.jobs.progress_poll_ms == 0 {
            return invalid("jobs.progress_poll_ms must be non-zero");
        }
        // atempo accepts 0.5..=100.0 per filter instance
        if !(0.5..=100.0).contains(&self.params.tempo_factor) {
            return invalid("params.tempo_factor must be within 0.5..=100");
        }
        if self.params.channels == 0 || self.params.sample_rate == 0 {
            return invalid("params.channels and params.sample_rate must be non-zero");
        }
        if self.upload.max_upload_mb == 0 {
            return invalid("upload.max_upload_mb must be non-zero");
        }
        Ok(())
    }
}
