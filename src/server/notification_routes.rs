//! Admin routes for notification overrides, the queue and the delivery log.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::actor::AdminActor;
use super::error::ApiError;
use super::state::{GuardedAdminOverrideManager, GuardedNotificationStore, ServerState};
use crate::notifications::{Channel, LogFilter, OverrideFields, OverrideTarget, QueueFilter};

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub target: OverrideTarget,
    #[serde(default)]
    pub fields: OverrideFields,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisableBody {
    pub target: OverrideTarget,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notify_user: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnableBody {
    pub target: OverrideTarget,
}

#[derive(Debug, Deserialize)]
pub struct TestBody {
    pub target: OverrideTarget,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub recipient: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct EnabledResponse {
    enabled: bool,
}

/// GET /overrides
async fn list_overrides(
    State(admin): State<GuardedAdminOverrideManager>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(admin.list_overrides()?))
}

/// POST /override
async fn override_target(
    actor: AdminActor,
    State(admin): State<GuardedAdminOverrideManager>,
    Json(body): Json<OverrideBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin_override =
        admin.override_target(&body.target, &body.fields, body.reason, actor.as_str())?;
    Ok(Json(admin_override))
}

/// POST /disable
async fn disable_target(
    actor: AdminActor,
    State(admin): State<GuardedAdminOverrideManager>,
    Json(body): Json<DisableBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = admin.disable(&body.target, body.reason, body.notify_user, actor.as_str())?;
    Ok(Json(outcome))
}

/// POST /enable
async fn enable_target(
    actor: AdminActor,
    State(admin): State<GuardedAdminOverrideManager>,
    Json(body): Json<EnableBody>,
) -> Result<impl IntoResponse, ApiError> {
    admin.enable(&body.target, actor.as_str())?;
    Ok(Json(EnabledResponse { enabled: true }))
}

/// POST /test
///
/// Delivers synchronously through the channel provider, so it runs on a
/// blocking thread.
async fn test_target(
    actor: AdminActor,
    State(admin): State<GuardedAdminOverrideManager>,
    Json(body): Json<TestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let report = tokio::task::spawn_blocking(move || {
        admin.test(&body.target, body.channel, body.recipient, actor.as_str())
    })
    .await
    .map_err(|e| ApiError::internal(format!("Test delivery panicked: {}", e)))??;
    Ok(Json(report))
}

/// GET /audit-log
async fn audit_log(
    State(admin): State<GuardedAdminOverrideManager>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(admin.audit_log(query.limit, query.offset)?))
}

/// GET /queue
async fn list_queue(
    State(store): State<GuardedNotificationStore>,
    Query(filter): Query<QueueFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(store.list_queue(&filter)?))
}

/// GET /queue/{id}
async fn get_queue_entry(
    State(store): State<GuardedNotificationStore>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match store.get_queue_entry(id)? {
        Some(entry) => Ok(Json(entry)),
        None => Err(ApiError::not_found(format!("queue entry {} not found", id))),
    }
}

/// GET /stats
async fn queue_stats(
    State(store): State<GuardedNotificationStore>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(store.queue_stats()?))
}

/// GET /log
async fn delivery_log(
    State(store): State<GuardedNotificationStore>,
    Query(filter): Query<LogFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(store.list_log(&filter)?))
}

/// Build the notification admin routes, nested under
/// `/v1/admin/notifications`.
pub fn notification_routes() -> Router<ServerState> {
    Router::new()
        .route("/overrides", get(list_overrides))
        .route("/override", post(override_target))
        .route("/disable", post(disable_target))
        .route("/enable", post(enable_target))
        .route("/test", post(test_target))
        .route("/audit-log", get(audit_log))
        .route("/queue", get(list_queue))
        .route("/queue/{id}", get(get_queue_entry))
        .route("/stats", get(queue_stats))
        .route("/log", get(delivery_log))
}
