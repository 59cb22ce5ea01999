// crates/server/src/main.rs
//! copyrem server binary.
//!
//! Loads configuration, starts the background sweeps, then serves until
//! Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use copyrem_core::ffmpeg::{self, ffmpeg_binary};
use copyrem_core::separator::demucs_available;
use copyrem_core::AppConfig;
use copyrem_server::{create_app, init_metrics, spawn_background, AppState};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default port when neither `--addr` nor `PORT` is given.
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Parser)]
#[command(name = "copyrem", version, about = "Audio transform server")]
struct Cli {
    /// Listen address. Defaults to 0.0.0.0:$PORT, or port 8080.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Built frontend to serve, with index.html fallback.
    #[arg(long, default_value = "frontend/dist")]
    static_dir: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Get the listen address from the CLI, `PORT`, or the default.
fn listen_addr(cli: &Cli) -> SocketAddr {
    cli.addr.unwrap_or_else(|| {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        SocketAddr::from(([0, 0, 0, 0], port))
    })
}

/// Startup check only. Jobs still fail individually if a tool is missing.
fn log_tool_availability() {
    let ffmpeg = ffmpeg_binary();
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    if ffmpeg.exists() || ffmpeg::resolve_in_path(ffmpeg::FFMPEG, &path_var).is_some() {
        tracing::info!(ffmpeg = %ffmpeg.display(), "ffmpeg found");
    } else {
        tracing::warn!("ffmpeg not found in ./bin or PATH; conversions will fail");
    }
    if !demucs_available() {
        tracing::warn!("demucs not found; separation jobs will fail");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("copyrem=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let cli = Cli::parse();
    init_metrics();

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let state = AppState::new(config);
    tokio::fs::create_dir_all(&state.scratch_dir)
        .await
        .with_context(|| format!("failed to create {}", state.scratch_dir.display()))?;

    log_tool_availability();

    let shutdown = CancellationToken::new();
    let background = spawn_background(&state, &shutdown);

    let app = create_app(state.clone(), Some(&cli.static_dir));
    let addr = listen_addr(&cli);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        addr = %addr,
        version = env!("CARGO_PKG_VERSION"),
        scratch_dir = %state.scratch_dir.display(),
        "copyrem listening"
    );

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        tracing::info!("shutting down");
        signal.cancel();
    })
    .await?;

    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}
