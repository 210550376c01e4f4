use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::debug;

use super::error::ApiError;
use super::state::ServerState;

pub const HEADER_ADMIN_USER_KEY: &str = "X-Admin-User";

/// The administrator performing a request, as named by the `X-Admin-User`
/// header. Authentication happens in front of this service.
#[derive(Debug, Clone)]
pub struct AdminActor(pub String);

impl AdminActor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn extract_admin_actor(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(HEADER_ADMIN_USER_KEY)?;
    match value.to_str() {
        Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => {
            debug!("Ignoring malformed {} header", HEADER_ADMIN_USER_KEY);
            None
        }
    }
}

impl FromRequestParts<ServerState> for AdminActor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _ctx: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        extract_admin_actor(parts).map(AdminActor).ok_or_else(|| {
            ApiError::bad_request(format!("Missing {} header", HEADER_ADMIN_USER_KEY))
        })
    }
}
