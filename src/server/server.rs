use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::job_routes::job_routes;
use super::metrics::metrics_handler;
use super::notification_routes::notification_routes;
use super::state::ServerState;
use super::user_routes::user_routes;
use super::log_requests;

#[derive(Serialize)]
struct HealthResponse {
    pub status: &'static str,
    pub uptime: String,
    pub hash: &'static str,
    pub scheduler_running: bool,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
        hash: env!("GIT_HASH"),
        scheduler_running: state.scheduler_handle.is_running(),
    })
}

/// Builds the HTTP application: admin API, event intake and preference API.
pub fn make_app(state: ServerState) -> Router {
    let admin_routes: Router<ServerState> = Router::new()
        .merge(job_routes())
        .nest("/notifications", notification_routes());

    let v1_routes: Router<ServerState> = user_routes().nest("/admin", admin_routes);

    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1_routes)
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves the application and the metrics endpoint until `shutdown` is
/// cancelled.
pub async fn run_server(state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let port = state.config.port;
    let metrics_port = state.config.metrics_port;
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    let metrics_listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;

    info!("Listening on port {}", port);
    info!("Serving metrics on port {}", metrics_port);

    let main_shutdown = shutdown.clone();
    let main_server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { main_shutdown.cancelled().await });

    let metrics_shutdown = shutdown.clone();
    let metrics_server = axum::serve(metrics_listener, make_metrics_app())
        .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await });

    tokio::try_join!(
        async { main_server.await.context("HTTP server failed") },
        async { metrics_server.await.context("Metrics server failed") },
    )?;
    Ok(())
}
