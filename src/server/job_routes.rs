//! Admin routes for background jobs.
//!
//! Provides endpoints for:
//! - Listing the registered job templates
//! - Job definition CRUD
//! - Manual runs and execution history

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::actor::AdminActor;
use super::error::ApiError;
use super::state::ServerState;
use crate::background_jobs::{CreateJobRequest, SchedulerHandle, UpdateJobRequest};

const MAX_EXECUTIONS_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    #[serde(default = "default_executions_limit")]
    pub limit: usize,
}

fn default_executions_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct RunJobResponse {
    pub job_id: String,
    pub execution_id: i64,
}

/// GET /job-templates
async fn list_templates(State(scheduler): State<SchedulerHandle>) -> impl IntoResponse {
    Json(scheduler.list_templates())
}

/// GET /jobs
async fn list_jobs(
    State(scheduler): State<SchedulerHandle>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(scheduler.list_jobs()?))
}

/// POST /jobs
async fn create_job(
    actor: AdminActor,
    State(scheduler): State<SchedulerHandle>,
    Json(body): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = scheduler.create_job(body, Some(actor.as_str()))?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs/{id}
async fn get_job(
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(scheduler.get_job(&job_id)?))
}

/// PUT /jobs/{id}
async fn update_job(
    actor: AdminActor,
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
    Json(body): Json<UpdateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = scheduler.update_job(&job_id, body)?;
    info!("{} updated job {}", actor.as_str(), job_id);
    Ok(Json(job))
}

/// DELETE /jobs/{id}
async fn delete_job(
    actor: AdminActor,
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    scheduler.delete_job(&job_id)?;
    info!("{} deleted job {}", actor.as_str(), job_id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/{id}/enable and /jobs/{id}/disable
async fn enable_job(
    actor: AdminActor,
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = scheduler.set_enabled(&job_id, true)?;
    info!("{} enabled job {}", actor.as_str(), job_id);
    Ok(Json(job))
}

async fn disable_job(
    actor: AdminActor,
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = scheduler.set_enabled(&job_id, false)?;
    info!("{} disabled job {}", actor.as_str(), job_id);
    Ok(Json(job))
}

/// POST /jobs/{id}/run
async fn run_job(
    actor: AdminActor,
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let execution_id = scheduler.run_now(&job_id).await?;
    info!(
        "{} triggered job {} (execution {})",
        actor.as_str(),
        job_id,
        execution_id
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(RunJobResponse {
            job_id,
            execution_id,
        }),
    ))
}

/// GET /jobs/{id}/executions
async fn get_executions(
    State(scheduler): State<SchedulerHandle>,
    Path(job_id): Path<String>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, MAX_EXECUTIONS_LIMIT);
    Ok(Json(scheduler.get_job_executions(&job_id, limit)?))
}

/// Build the job admin routes, nested under `/v1/admin`.
///
/// - GET /job-templates
/// - GET|POST /jobs
/// - GET|PUT|DELETE /jobs/{id}
/// - POST /jobs/{id}/run
/// - POST /jobs/{id}/enable, POST /jobs/{id}/disable
/// - GET /jobs/{id}/executions
pub fn job_routes() -> Router<ServerState> {
    Router::new()
        .route("/job-templates", get(list_templates))
        .route("/jobs", get(list_jobs).post(create_job))
        .route(
            "/jobs/{id}",
            get(get_job).put(update_job).delete(delete_job),
        )
        .route("/jobs/{id}/run", post(run_job))
        .route("/jobs/{id}/enable", post(enable_job))
        .route("/jobs/{id}/disable", post(disable_job))
        .route("/jobs/{id}/executions", get(get_executions))
}
