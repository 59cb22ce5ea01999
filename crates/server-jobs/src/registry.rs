// crates/server-jobs/src/registry.rs
//! The authoritative in-memory store of job state.
//!
//! Every read and write goes through one mutex. Removing a record and
//! deleting its files happen under that same lock, so a download can never
//! open a path that a concurrent cancel or expiry is unlinking, and each
//! artifact is deleted at most once.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{
    download_name, JobHandle, JobId, JobKind, JobOutputs, JobSnapshot, JobStatus, NewJob, Stem,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job not found")]
    NotFound,

    #[error("job is not finished")]
    Conflict,

    #[error("failed to open job output: {0}")]
    Io(#[from] std::io::Error),
}

/// A result file opened under the registry lock.
#[derive(Debug)]
pub struct OpenedOutput {
    pub file: File,
    pub len: u64,
    pub file_name: String,
}

struct JobEntry {
    kind: JobKind,
    status: JobStatus,
    percent: u8,
    error: Option<String>,
    display_name: String,
    input: Option<PathBuf>,
    outputs: JobOutputs,
    created: Instant,
    cancel: CancellationToken,
}

impl JobEntry {
    fn snapshot(&self, id: &JobId) -> JobSnapshot {
        JobSnapshot {
            id: id.clone(),
            kind: self.kind,
            status: self.status,
            percent: self.percent,
            error: self.error.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    ttl: Duration,
}

impl JobRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new Pending job under a fresh id.
    pub fn create(&self, new: NewJob) -> JobHandle {
        let kind = new.outputs.kind();
        let outputs = new.outputs.clone();
        let cancel = CancellationToken::new();
        let mut jobs = self.lock();

        let mut id = JobId::generate();
        while jobs.contains_key(&id) {
            id = JobId::generate();
        }
        jobs.insert(
            id.clone(),
            JobEntry {
                kind,
                status: JobStatus::Pending,
                percent: 0,
                error: None,
                display_name: new.display_name,
                input: Some(new.input),
                outputs: new.outputs,
                created: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        metrics::gauge!("jobs_active").set(jobs.len() as f64);
        drop(jobs);

        metrics::counter!("jobs_created_total", "kind" => kind.as_str()).increment(1);
        tracing::info!(job_id = %id, kind = kind.as_str(), "job created");
        JobHandle {
            id,
            kind,
            outputs,
            cancel,
        }
    }

    pub fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        self.lock().get(id).map(|entry| entry.snapshot(id))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_running(&self, id: &JobId) {
        if let Some(entry) = self.lock().get_mut(id) {
            if entry.status == JobStatus::Pending {
                entry.status = JobStatus::Running;
                tracing::debug!(job_id = %id, "job running");
            }
        }
    }

    /// Raise the percent of a live job. Lower or equal values, terminal
    /// jobs and unknown ids are ignored.
    pub fn set_percent(&self, id: &JobId, percent: u8) {
        if let Some(entry) = self.lock().get_mut(id) {
            if !entry.status.is_terminal() && percent > entry.percent {
                entry.percent = percent.min(100);
            }
        }
    }

    pub fn set_done(&self, id: &JobId) {
        let finished = match self.lock().get_mut(id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.status = JobStatus::Done;
                entry.percent = 100;
                true
            }
            _ => false,
        };
        if finished {
            metrics::counter!("jobs_finished_total", "outcome" => "done").increment(1);
            tracing::info!(job_id = %id, "job done");
        }
    }

    pub fn set_failed(&self, id: &JobId, message: impl Into<String>) {
        let message = message.into();
        let finished = match self.lock().get_mut(id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.status = JobStatus::Failed;
                entry.error = Some(message.clone());
                true
            }
            _ => false,
        };
        if finished {
            metrics::counter!("jobs_finished_total", "outcome" => "failed").increment(1);
            tracing::info!(job_id = %id, error = %message, "job failed");
        }
    }

    /// Delete the uploaded input once the transform no longer needs it.
    pub fn release_input(&self, id: &JobId) {
        let mut jobs = self.lock();
        if let Some(input) = jobs.get_mut(id).and_then(|entry| entry.input.take()) {
            remove_artifact(id, &input);
        }
    }

    /// Stop the job, remove its record and delete its files.
    ///
    /// Returns `false` if the id was unknown, which makes a second call a
    /// no-op.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut jobs = self.lock();
        let Some(entry) = jobs.remove(id) else {
            return false;
        };
        discard(id, entry);
        metrics::gauge!("jobs_active").set(jobs.len() as f64);
        drop(jobs);

        metrics::counter!("jobs_finished_total", "outcome" => "cancelled").increment(1);
        tracing::info!(job_id = %id, "job cancelled");
        true
    }

    /// Like `cancel`, but leaves Done jobs alone. The status check and the
    /// removal are one critical section.
    pub fn cancel_unless_done(&self, id: &JobId) -> bool {
        let mut jobs = self.lock();
        match jobs.get(id) {
            Some(entry) if entry.status != JobStatus::Done => {}
            _ => return false,
        }
        let Some(entry) = jobs.remove(id) else {
            return false;
        };
        discard(id, entry);
        metrics::gauge!("jobs_active").set(jobs.len() as f64);
        drop(jobs);

        metrics::counter!("jobs_finished_total", "outcome" => "cancelled").increment(1);
        tracing::info!(job_id = %id, "job cancelled after subscriber left");
        true
    }

    /// Remove every job older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut jobs = self.lock();
        let expired: Vec<JobId> = jobs
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.created) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = jobs.remove(id) {
                tracing::info!(job_id = %id, status = entry.status.as_str(), "job expired");
                discard(id, entry);
            }
        }
        metrics::gauge!("jobs_active").set(jobs.len() as f64);
        drop(jobs);

        if !expired.is_empty() {
            metrics::counter!("jobs_finished_total", "outcome" => "expired")
                .increment(expired.len() as u64);
        }
        expired.len()
    }

    /// Open a finished job's output for download.
    ///
    /// Single-output jobs are one-shot: the record and its files are removed
    /// as soon as the handle is open. Stem jobs stay until they expire.
    pub fn open_output(
        &self,
        id: &JobId,
        stem: Option<Stem>,
    ) -> Result<OpenedOutput, RegistryError> {
        let mut jobs = self.lock();
        let entry = jobs.get(id).ok_or(RegistryError::NotFound)?;
        if entry.status != JobStatus::Done {
            return Err(RegistryError::Conflict);
        }
        let path = entry.outputs.select(stem).ok_or(RegistryError::NotFound)?;

        // Blocking, but only an open and a stat of a local scratch file.
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let file_name = download_name(&entry.display_name, stem);

        if matches!(entry.outputs, JobOutputs::Single(_)) {
            if let Some(entry) = jobs.remove(id) {
                discard(id, entry);
            }
            metrics::gauge!("jobs_active").set(jobs.len() as f64);
            tracing::debug!(job_id = %id, "single output handed off, job removed");
        }

        Ok(OpenedOutput {
            file,
            len,
            file_name,
        })
    }
}

/// Signal the job's task and delete everything it owns. Callers hold the
/// registry lock and have already removed `entry` from the map.
///
/// A process that is still running can recreate an output after this; the
/// driving task removes those once the process has exited.
fn discard(id: &JobId, entry: JobEntry) {
    entry.cancel.cancel();
    if let Some(input) = &entry.input {
        remove_artifact(id, input);
    }
    for path in entry.outputs.paths() {
        remove_artifact(id, path);
    }
}

pub(crate) fn remove_artifact(id: &JobId, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(job_id = %id, path = %path.display(), "artifact removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(job_id = %id, path = %path.display(), error = %e, "failed to remove artifact")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(300);

    struct Fixture {
        dir: TempDir,
        registry: JobRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                registry: JobRegistry::new(TTL),
            }
        }

        fn touch(&self, name: &str, body: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            path
        }

        fn convert_job(&self) -> (JobHandle, PathBuf, PathBuf) {
            let input = self.touch("in.wav", b"RIFF");
            let output = self.dir.path().join("out.mp3");
            let handle = self.registry.create(NewJob {
                input: input.clone(),
                outputs: JobOutputs::Single(output.clone()),
                display_name: "Song".to_string(),
            });
            (handle, input, output)
        }

        fn separate_job(&self) -> (JobHandle, PathBuf, PathBuf) {
            let input = self.touch("in.flac", b"fLaC");
            let vocals = self.dir.path().join("v.mp3");
            let instrumental = self.dir.path().join("i.mp3");
            let handle = self.registry.create(NewJob {
                input,
                outputs: JobOutputs::Stems {
                    vocals: vocals.clone(),
                    instrumental: instrumental.clone(),
                },
                display_name: "Song".to_string(),
            });
            (handle, vocals, instrumental)
        }
    }

    #[test]
    fn test_create_starts_pending() {
        let fx = Fixture::new();
        let (handle, _, _) = fx.convert_job();
        let snap = fx.registry.get(&handle.id).unwrap();
        assert_eq!(snap.status, JobStatus::Pending);
        assert_eq!(snap.percent, 0);
        assert_eq!(snap.kind, JobKind::Convert);
        assert_eq!(handle.kind, JobKind::Convert);
        assert_eq!(fx.registry.len(), 1);
    }

    #[test]
    fn test_lookup_is_exact_match_only() {
        let fx = Fixture::new();
        let (handle, _, _) = fx.convert_job();
        let prefix = JobId::from(&handle.id.as_str()[..4]);
        assert!(fx.registry.get(&prefix).is_none());
        assert!(!fx.registry.cancel(&prefix));
    }

    #[test]
    fn test_percent_is_monotonic() {
        let fx = Fixture::new();
        let (handle, _, _) = fx.convert_job();
        fx.registry.set_running(&handle.id);

        let mut observed = Vec::new();
        for pct in [10, 35, 35, 20, 90, 5] {
            fx.registry.set_percent(&handle.id, pct);
            observed.push(fx.registry.get(&handle.id).unwrap().percent);
        }
        assert_eq!(observed, vec![10, 35, 35, 35, 90, 90]);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let fx = Fixture::new();
        let (handle, _, _) = fx.convert_job();
        fx.registry.set_running(&handle.id);
        fx.registry.set_percent(&handle.id, 40);
        fx.registry.set_done(&handle.id);

        fx.registry.set_failed(&handle.id, "late failure");
        fx.registry.set_running(&handle.id);
        fx.registry.set_percent(&handle.id, 50);

        let snap = fx.registry.get(&handle.id).unwrap();
        assert_eq!(snap.status, JobStatus::Done);
        assert_eq!(snap.percent, 100);
        assert_eq!(snap.error, None);
    }

    #[test]
    fn test_failed_keeps_percent_and_message() {
        let fx = Fixture::new();
        let (handle, _, _) = fx.convert_job();
        fx.registry.set_running(&handle.id);
        fx.registry.set_percent(&handle.id, 42);
        fx.registry.set_failed(&handle.id, "conversion failed");
        fx.registry.set_done(&handle.id);

        let snap = fx.registry.get(&handle.id).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.percent, 42);
        assert_eq!(snap.error.as_deref(), Some("conversion failed"));
    }

    #[test]
    fn test_mutators_on_unknown_id_are_noops() {
        let fx = Fixture::new();
        let ghost = JobId::from("0000000000000000");
        fx.registry.set_running(&ghost);
        fx.registry.set_percent(&ghost, 10);
        fx.registry.set_done(&ghost);
        fx.registry.set_failed(&ghost, "x");
        fx.registry.release_input(&ghost);
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn test_cancel_removes_record_and_files_once() {
        let fx = Fixture::new();
        let (handle, input, output) = fx.convert_job();
        std::fs::write(&output, b"partial").unwrap();
        fx.registry.set_running(&handle.id);

        assert!(fx.registry.cancel(&handle.id));
        assert!(handle.cancel.is_cancelled());
        assert!(fx.registry.get(&handle.id).is_none());
        assert!(!input.exists());
        assert!(!output.exists());

        assert!(!fx.registry.cancel(&handle.id));
    }

    #[test]
    fn test_cancel_unless_done() {
        let fx = Fixture::new();
        let (running, _, _) = fx.convert_job();
        let (done, _, _) = fx.separate_job();
        fx.registry.set_running(&running.id);
        fx.registry.set_done(&done.id);

        assert!(fx.registry.cancel_unless_done(&running.id));
        assert!(!fx.registry.cancel_unless_done(&done.id));
        assert!(fx.registry.get(&running.id).is_none());
        assert!(fx.registry.get(&done.id).is_some());
        assert!(!done.cancel.is_cancelled());
    }

    #[test]
    fn test_release_input_deletes_only_input() {
        let fx = Fixture::new();
        let (handle, input, output) = fx.convert_job();
        std::fs::write(&output, b"mp3").unwrap();

        fx.registry.release_input(&handle.id);
        assert!(!input.exists());
        assert!(output.exists());

        // The input is no longer owned, so cancel only touches the output.
        std::fs::write(&input, b"someone else's file").unwrap();
        fx.registry.cancel(&handle.id);
        assert!(input.exists());
        assert!(!output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_only_old_jobs() {
        let fx = Fixture::new();
        let (old, input, _) = fx.convert_job();
        let created = Instant::now();

        assert_eq!(fx.registry.sweep_expired_at(created + TTL), 0);
        assert!(fx.registry.get(&old.id).is_some());

        assert_eq!(
            fx.registry.sweep_expired_at(created + TTL + Duration::from_secs(1)),
            1
        );
        assert!(fx.registry.get(&old.id).is_none());
        assert!(old.cancel.is_cancelled());
        assert!(!input.exists());
    }

    #[test]
    fn test_download_before_done_is_conflict() {
        let fx = Fixture::new();
        let (handle, _, output) = fx.convert_job();
        std::fs::write(&output, b"partial").unwrap();
        fx.registry.set_running(&handle.id);

        let err = fx.registry.open_output(&handle.id, None).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict));
        assert!(output.exists());
        assert!(fx.registry.get(&handle.id).is_some());
    }

    #[test]
    fn test_single_output_download_is_one_shot() {
        let fx = Fixture::new();
        let (handle, _, output) = fx.convert_job();
        std::fs::write(&output, b"ID3 finished").unwrap();
        fx.registry.set_done(&handle.id);

        let mut opened = fx.registry.open_output(&handle.id, None).unwrap();
        assert_eq!(opened.file_name, "Song_modified.mp3");
        assert_eq!(opened.len, 12);

        // Record gone, but the open handle still reads the content.
        assert!(fx.registry.get(&handle.id).is_none());
        let mut body = String::new();
        opened.file.read_to_string(&mut body).unwrap();
        assert_eq!(body, "ID3 finished");

        let err = fx.registry.open_output(&handle.id, None).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));
    }

    #[test]
    fn test_stem_downloads_are_repeatable() {
        let fx = Fixture::new();
        let (handle, vocals, instrumental) = fx.separate_job();
        std::fs::write(&vocals, b"v").unwrap();
        std::fs::write(&instrumental, b"i").unwrap();
        fx.registry.set_done(&handle.id);

        for _ in 0..2 {
            let opened = fx.registry.open_output(&handle.id, Some(Stem::Vocals)).unwrap();
            assert_eq!(opened.file_name, "Song_vocals.mp3");
        }
        let opened = fx
            .registry
            .open_output(&handle.id, Some(Stem::Instrumental))
            .unwrap();
        assert_eq!(opened.file_name, "Song_instrumental.mp3");

        let err = fx.registry.open_output(&handle.id, None).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));
        assert!(fx.registry.get(&handle.id).is_some());
    }

    #[test]
    fn test_missing_output_file_is_io_error() {
        let fx = Fixture::new();
        let (handle, _, _) = fx.convert_job();
        fx.registry.set_done(&handle.id);

        let err = fx.registry.open_output(&handle.id, None).unwrap_err();
        assert!(matches!(err, RegistryError::Io(_)));
        // Failed hand-off does not consume the job.
        assert!(fx.registry.get(&handle.id).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_updates() {
        let fx = Fixture::new();
        let registry = Arc::new(fx.registry);
        let input = fx.dir.path().join("in.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let handle = registry.create(NewJob {
            input,
            outputs: JobOutputs::Single(fx.dir.path().join("out.mp3")),
            display_name: "Song".to_string(),
        });
        registry.set_running(&handle.id);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let registry = Arc::clone(&registry);
            let id = handle.id.clone();
            tasks.push(tokio::spawn(async move {
                for pct in 0..50u8 {
                    registry.set_percent(&id, pct + i);
                    tokio::task::yield_now().await;
                }
                registry.cancel(&id)
            }));
        }

        let mut cancelled = 0;
        for task in tasks {
            if task.await.unwrap() {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 1);
        assert!(registry.get(&handle.id).is_none());
    }
}
