// crates/server/src/rate_limit.rs
//! Sliding-window admission control for job creation.
//!
//! Each client key keeps the timestamps of its admitted requests inside the
//! current window. A request is admitted while fewer than `burst` remain;
//! rejected requests are not recorded. A periodic sweep drops keys whose
//! window has emptied so one-off clients do not accumulate.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::state::AppState;

/// Key used when neither a peer address nor a trusted header is available.
pub const UNKNOWN_CLIENT: &str = "unknown";

pub struct RateLimiter {
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
    burst: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(burst: usize, window: Duration) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            burst,
            window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut hits = self.lock();
        let stamps = hits.entry(key.to_string()).or_default();
        prune(stamps, now, self.window);
        if stamps.len() >= self.burst {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Drop keys with no timestamps inside the window. Returns how many
    /// keys were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut hits = self.lock();
        let before = hits.len();
        hits.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
        before - hits.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}

/// Remove timestamps that are at least `window` old. Stamps are pushed in
/// order, so expired ones are always at the front.
fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Sweep `limiter` every `every` until `shutdown` fires.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = limiter.sweep();
                    if dropped > 0 {
                        tracing::debug!(dropped, remaining = limiter.tracked_keys(), "rate limiter sweep");
                    }
                }
            }
        }
    })
}

/// Client identity for rate limiting.
///
/// With `trust_proxy`, the first non-empty `X-Forwarded-For` entry wins.
/// Otherwise the peer IP, or `"unknown"` without connection info.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());
        if let Some(first) = forwarded {
            return first.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Middleware guarding the job-creation routes.
pub async fn limit_job_creation(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(
        request.headers(),
        peer,
        state.config.rate_limit.trust_proxy,
    );

    if !state.limiter.allow(&key) {
        metrics::counter!("rate_limit_rejections_total").increment(1);
        tracing::warn!(client = %key, path = %request.uri().path(), "rate limit exceeded");
        return ApiError::AdmissionRejected.into_response();
    }
    next.run(request).await
}
