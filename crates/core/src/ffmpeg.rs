//! ffmpeg / ffprobe discovery and command-line construction.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::config::Params;

pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";

/// Bundled-binary directories checked before `PATH`:
/// `<exe dir>/bin`, then `<cwd>/bin`.
pub fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("bin"));
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd.join("bin"));
    }
    dirs
}

/// First `dir/name` that exists in `dirs`, else the bare `name` so the OS
/// resolves it through `PATH` at spawn time.
pub fn find_binary_in(name: &str, dirs: &[PathBuf]) -> PathBuf {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

pub fn ffmpeg_binary() -> PathBuf {
    find_binary_in(FFMPEG, &search_dirs())
}

/// `ffprobe` next to the resolved ffmpeg, if present.
pub fn probe_binary(ffmpeg: &Path) -> PathBuf {
    ffmpeg
        .parent()
        .map(|dir| dir.join(FFPROBE))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(FFPROBE))
}

/// Resolve an executable in a `PATH`-style list.
pub fn resolve_in_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Container duration reported by ffprobe, or `None` when it cannot be
/// determined. Missing duration only disables exact progress.
pub async fn probe_duration(ffprobe: &Path, input: &Path) -> Option<Duration> {
    let output = Command::new(ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
        .arg(input)
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::debug!(status = ?output.status.code(), "ffprobe failed");
            return None;
        }
        Err(e) => {
            tracing::debug!(error = %e, "ffprobe unavailable");
            return None;
        }
    };
    parse_duration_secs(&String::from_utf8_lossy(&output.stdout))
}

fn parse_duration_secs(text: &str) -> Option<Duration> {
    let secs: f64 = text.trim().parse().ok()?;
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

/// The `-af` chain: pitch shift (rate change + compensating tempo), tempo
/// change, resample round trip, per-channel delay.
pub fn filter_chain(params: &Params) -> String {
    let sr = params.sample_rate;
    let ratio = 2f64.powf(params.pitch_semitones / 12.0);

    let mut parts = vec![
        format!("asetrate={sr}*{ratio:.6}"),
        format!("aresample={sr}"),
        format!("atempo={:.6}", 1.0 / ratio),
        format!("atempo={:.4}", params.tempo_factor),
    ];
    parts.extend(params.resample_rates.iter().map(|r| format!("aresample={r}")));
    parts.push(format!("aresample={sr}"));
    parts.push(format!(
        "adelay={}|{}",
        params.delay_left_ms, params.delay_right_ms
    ));
    parts.join(",")
}

/// Full ffmpeg argument list for a conversion. With `progress`, ffmpeg
/// writes key/value progress records to stdout.
pub fn convert_args(params: &Params, input: &Path, output: &Path, progress: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if progress {
        args.extend(["-progress", "pipe:1"].map(OsString::from));
    }
    args.extend(["-y", "-i"].map(OsString::from));
    args.push(input.as_os_str().to_owned());
    args.push("-af".into());
    args.push(filter_chain(params).into());
    args.push("-b:a".into());
    args.push(params.bitrate.clone().into());
    args.push("-ar".into());
    args.push(params.sample_rate.to_string().into());
    args.push("-ac".into());
    args.push(params.channels.to_string().into());
    args.push(output.as_os_str().to_owned());
    args
}

/// Re-encode a separated WAV stem to MP3.
pub fn encode_mp3_args(wav: &Path, mp3: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-i"].map(OsString::from).to_vec();
    args.push(wav.as_os_str().to_owned());
    args.extend(["-c:a", "libmp3lame", "-b:a", "192k"].map(OsString::from));
    args.push(mp3.as_os_str().to_owned());
    args
}
