// crates/server-jobs/src/stream.rs
//! Per-subscriber progress stream, driven by polling the registry.
//!
//! The registry keeps no subscriber list. Each subscription polls on a fixed
//! interval, emits the percent when it changed, and ends with at most one
//! terminal event. Dropping the stream before that terminal event cancels the
//! job unless it already finished successfully.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::registry::JobRegistry;
use crate::types::{JobId, JobStatus};

/// Wire payload of one progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub percent: u8,
    #[serde(skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ProgressEvent {
    pub fn running(percent: u8) -> Self {
        Self {
            percent,
            done: false,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            percent: 100,
            done: true,
            error: None,
        }
    }

    pub fn failed(percent: u8, error: impl Into<String>) -> Self {
        Self {
            percent,
            done: false,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Cancels the job when the subscription is dropped while still armed.
struct DisconnectGuard {
    registry: Arc<JobRegistry>,
    id: JobId,
    armed: bool,
}

impl DisconnectGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed && self.registry.cancel_unless_done(&self.id) {
            tracing::info!(job_id = %self.id, "progress subscriber disconnected, job cancelled");
        }
    }
}

/// Progress events for `id`, polled every `poll`.
///
/// The stream ends without a terminal event if the job disappears
/// (cancelled or expired).
pub fn progress_events(
    registry: Arc<JobRegistry>,
    id: JobId,
    poll: Duration,
) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    async_stream::stream! {
        let mut guard = DisconnectGuard {
            registry: Arc::clone(&registry),
            id: id.clone(),
            armed: true,
        };
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_percent: Option<u8> = None;

        loop {
            ticker.tick().await;
            let Some(job) = registry.get(&id) else {
                tracing::debug!(job_id = %id, "job gone, closing progress stream");
                guard.disarm();
                break;
            };
            match job.status {
                JobStatus::Done => {
                    guard.disarm();
                    yield ProgressEvent::done();
                    break;
                }
                JobStatus::Failed => {
                    guard.disarm();
                    yield ProgressEvent::failed(job.percent, job.error.unwrap_or_default());
                    break;
                }
                JobStatus::Pending | JobStatus::Running => {
                    if last_percent != Some(job.percent) {
                        last_percent = Some(job.percent);
                        yield ProgressEvent::running(job.percent);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobOutputs, NewJob};
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const POLL: Duration = Duration::from_millis(500);

    fn registry_with_job(dir: &Path) -> (Arc<JobRegistry>, JobId) {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(300)));
        let input = dir.join("in.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let handle = registry.create(NewJob {
            input,
            outputs: JobOutputs::Single(dir.join("out.mp3")),
            display_name: "Song".to_string(),
        });
        (registry, handle.id)
    }

    #[test]
    fn test_event_payloads() {
        let json = |e: &ProgressEvent| serde_json::to_string(e).unwrap();
        assert_eq!(json(&ProgressEvent::running(35)), r#"{"percent":35}"#);
        assert_eq!(json(&ProgressEvent::done()), r#"{"percent":100,"done":true}"#);
        assert_eq!(
            json(&ProgressEvent::failed(40, "conversion failed")),
            r#"{"percent":40,"error":"conversion failed"}"#
        );
        assert!(!ProgressEvent::running(99).is_terminal());
        assert!(ProgressEvent::done().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_dropped_and_single_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(dir.path());
        registry.set_running(&id);
        registry.set_percent(&id, 10);

        let events = progress_events(Arc::clone(&registry), id.clone(), POLL);
        let collector = tokio::spawn(events.collect::<Vec<_>>());

        // Updates land between polls (ticks at 0, 500, 1000, ...).
        tokio::time::sleep(Duration::from_millis(750)).await;
        registry.set_percent(&id, 35);
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.set_percent(&id, 35);
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.set_percent(&id, 90);
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.set_done(&id);

        let events = collector.await.unwrap();
        assert_eq!(
            events,
            vec![
                ProgressEvent::running(10),
                ProgressEvent::running(35),
                ProgressEvent::running(90),
                ProgressEvent::done(),
            ]
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        // Finishing the stream never cancels a Done job.
        assert!(registry.get(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_terminal_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(dir.path());
        registry.set_running(&id);
        registry.set_percent(&id, 42);
        registry.set_failed(&id, "separation failed");

        let events: Vec<_> = progress_events(Arc::clone(&registry), id.clone(), POLL)
            .collect()
            .await;
        assert_eq!(events, vec![ProgressEvent::failed(42, "separation failed")]);
        assert!(registry.get(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_closes_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(dir.path());
        registry.set_running(&id);

        let events = progress_events(Arc::clone(&registry), id.clone(), POLL);
        let collector = tokio::spawn(events.collect::<Vec<_>>());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(registry.cancel(&id));

        let events = collector.await.unwrap();
        assert_eq!(events, vec![ProgressEvent::running(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job_yields_nothing() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(300)));
        let events: Vec<_> = progress_events(registry, JobId::from("deadbeef"), POLL)
            .collect()
            .await;
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(dir.path());
        registry.set_running(&id);

        let mut events = Box::pin(progress_events(Arc::clone(&registry), id.clone(), POLL));
        assert_eq!(events.next().await, Some(ProgressEvent::running(0)));
        drop(events);

        assert!(registry.get(&id).is_none());
        assert!(!dir.path().join("in.wav").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_done_job() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(dir.path());
        registry.set_running(&id);

        let mut events = Box::pin(progress_events(Arc::clone(&registry), id.clone(), POLL));
        assert_eq!(events.next().await, Some(ProgressEvent::running(0)));
        registry.set_done(&id);
        drop(events);

        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Done);
    }
}
