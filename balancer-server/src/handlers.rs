use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use health::HealthRegistry;
use meta_common::error::MetaError;
use meta_common::types::{JobID, JobRecord};

use crate::jobs::JobManager;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobManager>,
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub paras: Vec<String>,
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobID,
}

#[derive(Deserialize)]
pub struct LeaderBalanceRequest {
    pub space_name: String,
}

#[derive(Serialize)]
pub struct LeaderBalanceResponse {
    pub transfers: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

struct ApiError(MetaError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MetaError::Balanced => StatusCode::OK,
            MetaError::NotFound => StatusCode::NOT_FOUND,
            MetaError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            MetaError::LeaderChanged => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<MetaError> for ApiError {
    fn from(error: MetaError) -> Self {
        Self(error)
    }
}

pub fn router(state: AppState, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())))
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/leader-balance", post(leader_balance))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "meta balancer"
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let job_id = state.jobs.submit(request.paras).await?;
    Ok(Json(CreateJobResponse { job_id }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobID>,
) -> Result<Json<JobRecord>, ApiError> {
    let record = state.jobs.job_record(id).await?;
    Ok(Json(record))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<JobID>,
) -> Result<StatusCode, ApiError> {
    state.jobs.stop(id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn leader_balance(
    State(state): State<AppState>,
    Json(request): Json<LeaderBalanceRequest>,
) -> Result<Json<LeaderBalanceResponse>, ApiError> {
    let transfers = state.jobs.leader_balance(&request.space_name).await?;
    Ok(Json(LeaderBalanceResponse { transfers }))
}
