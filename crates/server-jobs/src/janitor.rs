//! Periodic expiry of jobs older than the registry TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::JobRegistry;

/// Sweep `registry` every `every` until `shutdown` fires.
///
/// The first sweep runs one interval after startup.
pub fn spawn_janitor(
    registry: Arc<JobRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!("janitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = registry.sweep_expired();
                    if expired > 0 {
                        tracing::info!(expired, remaining = registry.len(), "janitor sweep");
                    }
                }
            }
        }
    })
}
