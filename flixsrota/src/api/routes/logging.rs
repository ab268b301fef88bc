//! Runtime log filter.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{LogFilterResponse, UpdateLogFilterRequest};
use crate::api::server::AppState;
use crate::logging::LogHandle;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_filter).put(update_filter))
}

fn handle(state: &AppState) -> ApiResult<&LogHandle> {
    state
        .log_handle
        .as_deref()
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterResponse>> {
    let filter = handle(&state)?.get_filter();
    Ok(Json(LogFilterResponse { filter }))
}

async fn update_filter(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LogFilterResponse>> {
    let handle = handle(&state)?;
    handle.set_filter(&request.filter)?;
    Ok(Json(LogFilterResponse {
        filter: handle.get_filter(),
    }))
}
