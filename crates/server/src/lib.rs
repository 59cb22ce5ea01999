// crates/server/src/lib.rs
//! copyrem server library.
//!
//! Axum HTTP surface over the job orchestration in `copyrem-server-jobs`:
//! uploads start convert or separate jobs, clients follow them over SSE,
//! then download the results.

pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod routes;
pub mod security;
pub mod state;
pub mod upload;

pub use error::*;
pub use metrics::{init_metrics, render_metrics};
pub use rate_limit::RateLimiter;
pub use routes::api_routes;
pub use state::AppState;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    response::Html,
    Router,
};
use copyrem_server_jobs::spawn_janitor;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

/// Served for unknown paths when no frontend build is present.
const FRONTEND_MISSING_HTML: &str = "<!doctype html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>copyrem</title></head>\n<body>\n<h1>copyrem</h1>\n<p>The frontend has not been built. Run <code>npm run build</code> in <code>frontend/</code> and restart the server.</p>\n</body>\n</html>\n";

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - job routes, `/api/info`, `/api/health`, `/metrics`
/// - static assets from `static_dir` with `index.html` fallback, when the
///   directory exists
/// - security headers, CORS for the configured origins, request tracing
pub fn create_app(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    let app = api_routes(state);

    let app = match static_dir.filter(|dir| dir.is_dir()) {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "serving static frontend");
            let spa = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
            app.fallback_service(spa)
        }
        None => app.fallback(|| async { Html(FRONTEND_MISSING_HTML) }),
    };

    app.layer(cors)
        .layer(middleware::from_fn(security::security_headers))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86_400))
}

/// Start the janitor and the rate-limit sweeper. Both stop when
/// `shutdown` is cancelled.
pub fn spawn_background(state: &AppState, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        spawn_janitor(
            Arc::clone(&state.jobs),
            state.config.jobs.sweep_interval(),
            shutdown.clone(),
        ),
        rate_limit::spawn_sweeper(
            Arc::clone(&state.limiter),
            state.config.rate_limit.sweep_interval(),
            shutdown.clone(),
        ),
    ]
}

// ============================================================================
// Integration Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use copyrem_core::{AppConfig, ExternalTools};
    use tower::ServiceExt;

    fn test_state(dir: &Path) -> Arc<AppState> {
        AppState::with_transforms(
            AppConfig::default(),
            dir.to_path_buf(),
            Arc::new(ExternalTools::default()),
        )
    }

    /// Helper to make a GET request to the app.
    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()), None);
        let (status, body) = get(app, "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_only() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()), None);

        let preflight = |origin: &'static str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/convert")
                .header("Origin", origin)
                .header("Access-Control-Request-Method", "POST")
                .body(Body::empty())
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(preflight("http://localhost:5173"))
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );

        let response = app.oneshot(preflight("http://evil.example")).await.unwrap();
        assert!(!response
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_fallback_without_frontend() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("dist");
        let app = create_app(test_state(dir.path()), Some(&missing));
        let (status, body) = get(app, "/some/page").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("frontend has not been built"));
    }

    #[tokio::test]
    async fn test_spa_fallback_serves_index() {
        let dir = tempfile::tempdir().unwrap();
        let dist = dir.path().join("dist");
        std::fs::create_dir_all(dist.join("assets")).unwrap();
        std::fs::write(dist.join("index.html"), "<div id=app></div>").unwrap();
        std::fs::write(dist.join("assets/app.js"), "console.log(1)").unwrap();

        let app = create_app(test_state(dir.path()), Some(&dist));
        let (status, body) = get(app.clone(), "/assets/app.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "console.log(1)");

        let (status, body) = get(app, "/convert-page").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<div id=app></div>");
    }

    #[tokio::test]
    async fn test_security_headers_on_api_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()), None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/convert/download/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_stop_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let shutdown = CancellationToken::new();
        let tasks = spawn_background(&state, &shutdown);
        assert_eq!(tasks.len(), 2);

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
