//! Job submission, status and cancellation.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    CreateJobRequest, CreateJobResponse, JobResponse, ListJobsQuery, MAX_PAGE_SIZE,
    PaginatedResponse,
};
use crate::api::server::AppState;
use crate::queue::JobStatus;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/{id}", get(get_job))
        .route("/{id}/cancel", post(cancel_job))
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    if request.input_path.trim().is_empty() {
        return Err(ApiError::bad_request("input_path must not be empty"));
    }
    if request.output_path.trim().is_empty() {
        return Err(ApiError::bad_request("output_path must not be empty"));
    }

    let job = request.into_job();
    let priority = job.priority;
    let id = state.store.enqueue(job).await?;
    info!(job_id = %id, priority, "Job submitted");

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            id,
            status: JobStatus::Queued,
        }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<PaginatedResponse<JobResponse>>> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(
            s.parse::<JobStatus>()
                .map_err(|_| ApiError::bad_request(format!("Unknown status '{}'", s)))?,
        ),
    };
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);

    let page = state.store.list_jobs(status, limit, query.offset).await?;
    Ok(Json(PaginatedResponse {
        items: page.jobs.into_iter().map(JobResponse::from).collect(),
        total: page.total,
        limit,
        offset: query.offset,
    }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.store.get_job(&id).await?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = match &state.processor {
        Some(processor) => processor.cancel_job(&id).await?,
        None => state.store.cancel_job(&id).await?,
    };
    info!(job_id = %id, status = %job.status, "Cancel requested");
    Ok(Json(job.into()))
}
