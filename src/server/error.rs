//! JSON error responses for the HTTP API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::background_jobs::JobError;
use crate::notifications::{AdminError, PreferenceError};

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(e) => ApiError::bad_request(e.to_string()),
            JobError::NotFound => ApiError::not_found(err.to_string()),
            JobError::AlreadyRunning | JobError::Disabled => {
                ApiError::new(StatusCode::CONFLICT, err.to_string())
            }
            JobError::ExecutionFailed(_) | JobError::Cancelled | JobError::Timeout => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            JobError::Storage(e) => {
                error!("Job storage error: {:#}", e);
                ApiError::internal("Storage error")
            }
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Validation(message) => ApiError::bad_request(message),
            AdminError::NotFound(_) => ApiError::not_found(err.to_string()),
            AdminError::Storage(e) => {
                error!("Notification storage error: {:#}", e);
                ApiError::internal("Storage error")
            }
        }
    }
}

impl From<PreferenceError> for ApiError {
    fn from(err: PreferenceError) -> Self {
        match err {
            PreferenceError::UnknownUser(_) => ApiError::not_found(err.to_string()),
            PreferenceError::Invalid(_) => ApiError::bad_request(err.to_string()),
            PreferenceError::Storage(e) => {
                error!("Preference storage error: {:#}", e);
                ApiError::internal("Storage error")
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("Request failed: {:#}", err);
        ApiError::internal("Internal error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::ValidationError;

    #[test]
    fn test_job_errors_map_to_statuses() {
        let cases = vec![
            (JobError::NotFound, StatusCode::NOT_FOUND),
            (JobError::AlreadyRunning, StatusCode::CONFLICT),
            (JobError::Disabled, StatusCode::CONFLICT),
            (
                JobError::Validation(ValidationError::UnknownTemplateType("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                JobError::Storage(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_admin_and_preference_errors() {
        assert_eq!(
            ApiError::from(AdminError::NotFound("user bob".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(PreferenceError::Invalid("bad".into())).status,
            StatusCode::BAD_REQUEST
        );
        let err = ApiError::from(PreferenceError::UnknownUser("bob".into()));
        assert_eq!(err.message, "user bob is not registered");
    }
}
