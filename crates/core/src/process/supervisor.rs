// crates/core/src/process/supervisor.rs
//! Spawn one external process, feed its progress, and kill it on cancel.
//!
//! Every entry point:
//! - nulls stdin and drains stderr into a bounded tail used for diagnostics;
//! - sets `kill_on_drop`, so dropping the future also reaps the child;
//! - on cancellation kills the process (not just stops reading) and returns
//!   `ProcessError::Cancelled`, which is distinct from a failed exit.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::progress::{exact_percent, parse_out_time_us, HeuristicRamp, Progress};
use super::ProcessError;

/// Bytes of stderr kept for `ExitedNonZero` diagnostics.
const DIAGNOSTICS_LIMIT: usize = 4 * 1024;

/// Run `cmd` until it exits, without progress.
pub async fn run_to_completion(
    mut cmd: Command,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }
    let program = program_name(&cmd);
    let mut child = spawn(&mut cmd, &program, false)?;
    let stderr = drain_stderr(&mut child);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child, &program).await;
            stderr.abort();
            Err(ProcessError::Cancelled)
        }
        status = child.wait() => exit_outcome(status, &program, stderr, cancel).await,
    }
}

/// Run `cmd` whose stdout carries ffmpeg `-progress` key/value lines.
///
/// Percent is `min(99, out_time / total * 100)`; the caller reports 100
/// once this returns `Ok`.
pub async fn run_with_exact_progress(
    mut cmd: Command,
    cancel: &CancellationToken,
    total: Duration,
    progress: &mut Progress,
) -> Result<(), ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }
    let program = program_name(&cmd);
    let mut child = spawn(&mut cmd, &program, true)?;
    let stderr = drain_stderr(&mut child);
    let total_us = total.as_micros() as f64;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate(&mut child, &program).await;
                    stderr.abort();
                    return Err(ProcessError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(us) = parse_out_time_us(&line) {
                            progress.report(exact_percent(us, total_us));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(program = %program, error = %e, "progress channel closed");
                        break;
                    }
                }
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child, &program).await;
            stderr.abort();
            Err(ProcessError::Cancelled)
        }
        status = child.wait() => exit_outcome(status, &program, stderr, cancel).await,
    }
}

/// Run `cmd` with no progress channel, reporting `ramp` every `tick`.
pub async fn run_with_ramp(
    mut cmd: Command,
    cancel: &CancellationToken,
    ramp: HeuristicRamp,
    tick: Duration,
    progress: &mut Progress,
) -> Result<(), ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }
    let program = program_name(&cmd);
    let mut child = spawn(&mut cmd, &program, false)?;
    let stderr = drain_stderr(&mut child);

    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + tick, tick);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, &program).await;
                stderr.abort();
                return Err(ProcessError::Cancelled);
            }
            status = child.wait() => {
                return exit_outcome(status, &program, stderr, cancel).await;
            }
            _ = ticker.tick() => {
                progress.report(ramp.percent(started.elapsed()));
            }
        }
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

fn spawn(cmd: &mut Command, program: &str, capture_stdout: bool) -> Result<Child, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        tracing::error!(program = %program, error = %e, "failed to spawn process");
        ProcessError::launch(program, e)
    })?;
    tracing::debug!(program = %program, pid = ?child.id(), "process spawned");
    Ok(child)
}

/// Keep the last `DIAGNOSTICS_LIMIT` bytes of stderr. Draining also keeps a
/// chatty child from blocking on a full pipe.
fn drain_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut tail = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > DIAGNOSTICS_LIMIT {
                        let excess = tail.len() - DIAGNOSTICS_LIMIT;
                        tail.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}

async fn terminate(child: &mut Child, program: &str) {
    match child.kill().await {
        Ok(()) => tracing::info!(program = %program, "process killed on cancellation"),
        // Already exited between the cancel and the kill.
        Err(e) => tracing::debug!(program = %program, error = %e, "kill after exit"),
    }
}

async fn exit_outcome(
    status: std::io::Result<ExitStatus>,
    program: &str,
    stderr: JoinHandle<String>,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            stderr.abort();
            return Err(ProcessError::ExitedNonZero {
                program: program.to_string(),
                code: None,
                diagnostics: e.to_string(),
            });
        }
    };

    if status.success() {
        stderr.abort();
        tracing::debug!(program = %program, "process exited successfully");
        return Ok(());
    }
    if cancel.is_cancelled() {
        stderr.abort();
        return Err(ProcessError::Cancelled);
    }

    let diagnostics = stderr.await.unwrap_or_default();
    tracing::warn!(
        program = %program,
        exit_code = ?status.code(),
        stderr = %diagnostics,
        "process exited with failure"
    );
    Err(ProcessError::ExitedNonZero {
        program: program.to_string(),
        code: status.code(),
        diagnostics,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn recording() -> (Progress, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let progress = Progress::new(Arc::new(move |pct| sink_seen.lock().unwrap().push(pct)));
        (progress, seen)
    }

    #[tokio::test]
    async fn test_successful_exit() {
        let cancel = CancellationToken::new();
        assert!(run_to_completion(sh("exit 0"), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_diagnostics() {
        let cancel = CancellationToken::new();
        let err = run_to_completion(sh("echo boom >&2; exit 3"), &cancel)
            .await
            .unwrap_err();
        match err {
            ProcessError::ExitedNonZero { code, diagnostics, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(diagnostics, "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let cancel = CancellationToken::new();
        let cmd = Command::new("/nonexistent/copyrem-test-binary");
        let err = run_to_completion(cmd, &cancel).await.unwrap_err();
        assert!(matches!(err, ProcessError::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_to_completion(sh(&format!("touch {}", marker.display())), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_cancel_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let script = format!("sleep 1 && touch {}", marker.display());
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run_to_completion(sh(&script), &cancel),
        )
        .await
        .expect("cancellation should return promptly");
        assert!(outcome.unwrap_err().is_cancelled());

        // The shell was killed, so it never reaches `touch`.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_exact_progress_from_progress_lines() {
        let cancel = CancellationToken::new();
        let (mut progress, seen) = recording();
        let script = "echo out_time_us=250000; echo out_time_us=500000; \
                      echo out_time_us=N/A; echo out_time_us=500000; \
                      echo out_time_us=1000000; echo progress=end";

        run_with_exact_progress(sh(script), &cancel, Duration::from_secs(1), &mut progress)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![25, 50, 99]);
    }

    #[tokio::test]
    async fn test_exact_progress_cancel() {
        let cancel = CancellationToken::new();
        let (mut progress, _seen) = recording();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run_with_exact_progress(
                sh("echo out_time_us=1; exec sleep 30"),
                &cancel,
                Duration::from_secs(10),
                &mut progress,
            ),
        )
        .await
        .expect("cancellation should return promptly");
        assert!(outcome.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_ramp_progress_is_monotonic_and_capped() {
        let cancel = CancellationToken::new();
        let (mut progress, seen) = recording();
        let ramp = HeuristicRamp {
            floor: 10,
            span: 60,
            cap: 70,
            window: Duration::from_millis(200),
        };

        run_with_ramp(
            sh("sleep 0.5"),
            &cancel,
            ramp,
            Duration::from_millis(20),
            &mut progress,
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(seen.iter().all(|pct| *pct <= 70));
    }
}
