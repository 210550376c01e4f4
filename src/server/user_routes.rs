//! Domain event intake and per-user notification preferences.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::error::ApiError;
use super::state::{
    GuardedEventDispatcher, GuardedNotificationService, GuardedUserDirectory, ServerState,
};
use crate::notifications::{DispatchSummary, DomainEvent, PreferencesUpdate, UserProfile};
use crate::server::metrics;

#[derive(Debug, Deserialize)]
pub struct RegisterUserBody {
    #[serde(flatten)]
    pub profile: UserProfile,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterUserResponse {
    pub username: String,
    pub created: bool,
}

/// POST /events
///
/// Always answers 202: the reporting service must not depend on what the
/// notification side did with the event.
async fn post_event(
    State(dispatcher): State<GuardedEventDispatcher>,
    Json(event): Json<DomainEvent>,
) -> impl IntoResponse {
    let summary = match tokio::task::spawn_blocking(move || dispatcher.dispatch(&event)).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Event dispatch panicked: {}", e);
            metrics::record_dispatch_error();
            DispatchSummary::default()
        }
    };
    (StatusCode::ACCEPTED, Json(summary))
}

/// POST /users
async fn register_user(
    State(service): State<GuardedNotificationService>,
    State(directory): State<GuardedUserDirectory>,
    Json(body): Json<RegisterUserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let username = body.profile.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::bad_request("username must not be empty"));
    }
    if let Some(tz) = body.timezone.as_deref() {
        if tz.parse::<chrono_tz::Tz>().is_err() {
            return Err(ApiError::bad_request(format!("invalid timezone '{}'", tz)));
        }
    }

    let created = service.register_user(&username, body.timezone.as_deref())?;
    directory.upsert_profile(&UserProfile {
        username: username.clone(),
        ..body.profile
    })?;
    if created {
        info!("Registered user {}", username);
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(RegisterUserResponse { username, created })))
}

/// GET /users/{username}/preferences
async fn get_preferences(
    State(service): State<GuardedNotificationService>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match service.get_user_preferences(&username)? {
        Some(preferences) => Ok(Json(preferences)),
        None => Err(ApiError::not_found(format!(
            "user {} is not registered",
            username
        ))),
    }
}

/// PUT /users/{username}/preferences
async fn put_preferences(
    State(service): State<GuardedNotificationService>,
    Path(username): Path<String>,
    Json(update): Json<PreferencesUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(service.update_user_preferences(&username, update)?))
}

/// Build the public API routes, nested under `/v1`.
pub fn user_routes() -> Router<ServerState> {
    Router::new()
        .route("/events", post(post_event))
        .route("/users", post(register_user))
        .route(
            "/users/{username}/preferences",
            get(get_preferences).put(put_preferences),
        )
}
