//! HTTP surface: the WebSocket router, the metrics/health router and the
//! process-level run loop.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{presented_credential, AuthGate},
    config::Config,
    error::SessionError,
    fault::FaultPolicy,
    handler::ws_handler,
    metrics::Metrics,
    protocol::ErrorCode,
    registry::{spawn_sweeper, SessionRegistry},
};

pub struct AppState {
    pub config: Config,
    pub registry: SessionRegistry,
    pub auth: AuthGate,
    pub fault: FaultPolicy,
    pub metrics: Arc<Metrics>,
    /// Cancelled once the server starts shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let registry = SessionRegistry::from_config(&config, Arc::clone(&metrics));
        let auth = AuthGate::new(config.auth_token.as_ref());
        let fault = FaultPolicy::new(config.fault_mode, config.fault_override);
        Arc::new(Self {
            config,
            registry,
            auth,
            fault,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        if self.auth.authenticate(presented_credential(headers, None)) {
            return Ok(());
        }
        self.metrics.auth_failed();
        let body = serde_json::json!({
            "code": ErrorCode::AuthFailed,
            "message": "authentication failed",
        });
        Err((StatusCode::UNAUTHORIZED, Json(body)).into_response())
    }
}

/// Routes served on the main listener.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", delete(close_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Routes served on the metrics listener.
pub fn build_metrics_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "sessions": snapshot.sessions_active,
        "connected": snapshot.sessions_connected,
        "disconnected": snapshot.sessions_disconnected,
        "idle": snapshot.sessions_idle,
        "read_only": state.config.read_only,
    }))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Response> {
    state.authorize(&headers)?;
    Ok(Json(serde_json::json!({
        "sessions": state.registry.list(),
    })))
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, Response> {
    state.authorize(&headers)?;
    info!("[http] DELETE /sessions/{}", session_id);

    let id = Uuid::parse_str(&session_id)
        .map_err(|_| SessionError::InvalidSessionId(session_id.clone()).into_response())?;
    state.registry.close(id).map_err(|e| {
        warn!("[http] Close of {} failed: {}", session_id, e);
        e.into_response()
    })?;

    Ok(Json(serde_json::json!({
        "status": "closed",
        "id": session_id,
    })))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ready")
    }
}

/// Serves `router` on `listener` until `shutdown` fires, then waits for
/// in-flight connections to finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Server error")
}

/// Runs both listeners and the idle sweep until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::new(config);

    let listener = TcpListener::bind(state.config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", state.config.listen))?;
    let metrics_listener = TcpListener::bind(state.config.metrics_listen)
        .await
        .with_context(|| format!("Failed to bind to {}", state.config.metrics_listen))?;

    info!("PTY daemon listening on {}", listener.local_addr()?);
    info!("Metrics listening on {}", metrics_listener.local_addr()?);

    let sweeper = spawn_sweeper(
        state.registry.clone(),
        state.config.sweep_interval,
        state.shutdown.clone(),
    );
    let metrics_server = tokio::spawn(serve(
        metrics_listener,
        build_metrics_router(Arc::clone(&state)),
        state.shutdown.clone(),
    ));

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let result = serve(
        listener,
        build_router(Arc::clone(&state)),
        state.shutdown.clone(),
    )
    .await;

    state.shutdown.cancel();
    state.registry.shutdown();
    let _ = sweeper.await;
    match metrics_server.await {
        Ok(Err(e)) => warn!("Metrics server failed: {:#}", e),
        Err(e) => warn!("Metrics server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    info!("PTY daemon stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use clap::Parser;
    use tower::ServiceExt;

    fn test_state(args: &[&str]) -> Arc<AppState> {
        let mut argv = vec!["cmux-ptyd", "--command", "/bin/cat"];
        argv.extend_from_slice(args);
        AppState::new(Config::try_parse_from(argv).unwrap())
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state(&[]));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_sessions_require_credential_when_enabled() {
        let state = test_state(&["--auth-token", "s3cret"]);
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("auth_failed"));
        assert_eq!(state.metrics.snapshot().auth_failures, 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let app = build_router(test_state(&[]));
        let uri = format!("/sessions/{}", Uuid::new_v4());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("session_not_found"));
    }

    #[tokio::test]
    async fn test_close_existing_session() {
        let state = test_state(&[]);
        let attached = state
            .registry
            .create_session("127.0.0.1".parse().unwrap(), None)
            .await
            .unwrap();
        let app = build_router(Arc::clone(&state));

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/sessions/{}", attached.handle.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.registry.is_empty());
        assert!(attached.evicted.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_rejects_malformed_id() {
        let app = build_router(test_state(&[]));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/sessions/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state(&[]);
        state.metrics.admission_rejected();
        let app = build_metrics_router(state);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_string(response).await;
        assert!(text.contains("ptyd_admissions_rejected_total 1"));
        assert!(text.contains("ptyd_sessions_connected 0"));
        assert!(text.contains("ptyd_output_dropped_bytes_total 0"));
    }

    #[tokio::test]
    async fn test_readyz_tracks_shutdown() {
        let state = test_state(&[]);
        let app = build_metrics_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.shutdown.cancel();
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
