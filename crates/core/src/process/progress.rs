// crates/core/src/process/progress.rs
//! Percent extraction and rate-limited reporting.
//!
//! Two sources feed a `Progress`:
//! - exact: ffmpeg's `-progress pipe:1` emits `out_time_us=<µs>` lines that
//!   are compared against the probed input duration;
//! - heuristic: a wall-clock ramp (`HeuristicRamp`) for black-box tools.
//!   This is a UI convenience only, not a measurement.
//!
//! Neither source may emit 100; only `Progress::complete` does, and callers
//! invoke it after the operation has exited successfully.

use std::time::Duration;

use tokio::time::Instant;

use super::ProgressSink;

/// Highest percent an in-flight operation may report.
pub const IN_FLIGHT_CEILING: u8 = 99;

const DEFAULT_MIN_STEP: u8 = 2;
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Parse one line of ffmpeg `-progress` output.
///
/// Returns the elapsed output time in microseconds for `out_time_us=` lines,
/// `None` for every other key and for `N/A` or negative values.
pub fn parse_out_time_us(line: &str) -> Option<f64> {
    line.trim()
        .strip_prefix("out_time_us=")?
        .parse::<f64>()
        .ok()
        .filter(|us| us.is_finite() && *us >= 0.0)
}

/// `min(99, elapsed / total * 100)`; 0 when the total is unknown.
pub fn exact_percent(elapsed_us: f64, total_us: f64) -> u8 {
    if total_us <= 0.0 || !total_us.is_finite() {
        return 0;
    }
    let pct = (elapsed_us / total_us * 100.0).clamp(0.0, IN_FLIGHT_CEILING as f64);
    pct as u8
}

/// Wall-clock progress estimate for tools without a progress channel.
///
/// `floor + span * elapsed / window`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeuristicRamp {
    pub floor: u8,
    pub span: u8,
    pub cap: u8,
    pub window: Duration,
}

impl HeuristicRamp {
    /// Ramp used for source separation: 10% → 70% over five minutes.
    pub const SEPARATION: HeuristicRamp = HeuristicRamp {
        floor: 10,
        span: 60,
        cap: 70,
        window: Duration::from_secs(5 * 60),
    };

    pub fn percent(&self, elapsed: Duration) -> u8 {
        if self.window.is_zero() {
            return self.cap;
        }
        let ratio = elapsed.as_secs_f64() / self.window.as_secs_f64();
        let pct = self.floor as f64 + self.span as f64 * ratio;
        pct.min(self.cap as f64) as u8
    }
}

/// Drops duplicate, decreasing and too-frequent updates.
///
/// An update is admitted when it is strictly greater than the last admitted
/// value and either moved by at least `min_step` or arrived at least
/// `min_interval` after the previous admission.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_step: u8,
    min_interval: Duration,
    last: u8,
    last_at: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_step: u8, min_interval: Duration) -> Self {
        Self {
            min_step,
            min_interval,
            last: 0,
            last_at: None,
        }
    }

    pub fn admit(&mut self, pct: u8, now: Instant) -> bool {
        if pct <= self.last {
            return false;
        }
        let step_ok = pct - self.last >= self.min_step;
        let time_ok = self
            .last_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.min_interval);
        if step_ok || time_ok {
            self.mark(pct, now);
            true
        } else {
            false
        }
    }

    fn mark(&mut self, pct: u8, now: Instant) {
        self.last = pct;
        self.last_at = Some(now);
    }

    pub fn last(&self) -> u8 {
        self.last
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_STEP, DEFAULT_MIN_INTERVAL)
    }
}

/// Monotonic progress reporter for one operation.
pub struct Progress {
    sink: ProgressSink,
    throttle: ProgressThrottle,
}

impl Progress {
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            sink,
            throttle: ProgressThrottle::default(),
        }
    }

    /// Throttled in-flight update, capped at 99.
    pub fn report(&mut self, pct: u8) {
        self.report_at(pct, Instant::now());
    }

    pub fn report_at(&mut self, pct: u8, now: Instant) {
        let pct = pct.min(IN_FLIGHT_CEILING);
        if self.throttle.admit(pct, now) {
            self.emit(pct);
        }
    }

    /// Fixed checkpoint after a deterministic step; bypasses the rate limit
    /// but never goes backwards.
    pub fn checkpoint(&mut self, pct: u8) {
        let pct = pct.min(IN_FLIGHT_CEILING);
        if pct > self.throttle.last() {
            self.throttle.mark(pct, Instant::now());
            self.emit(pct);
        }
    }

    /// Report 100. Call only after the operation has exited successfully.
    pub fn complete(&mut self) {
        if self.throttle.last() < 100 {
            self.throttle.mark(100, Instant::now());
            self.emit(100);
        }
    }

    pub fn last(&self) -> u8 {
        self.throttle.last()
    }

    fn emit(&self, pct: u8) {
        (self.sink)(pct);
    }
}
