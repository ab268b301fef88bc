//! Health and queue statistics.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::{HealthResponse, WorkerStats};
use crate::api::server::AppState;
use crate::worker::DispatchStats;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let queue_depth = state.store.queue_depth().await?;
    let stats = state
        .processor
        .as_ref()
        .map(|p| p.stats())
        .unwrap_or_default();

    let status = match &state.processor {
        Some(p) if p.is_running() => "healthy",
        Some(_) => "stopped",
        None => "degraded",
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_depth,
        workers: worker_stats(stats),
    }))
}

fn worker_stats(stats: DispatchStats) -> WorkerStats {
    WorkerStats {
        idle: stats.idle_workers,
        busy: stats.busy_workers,
        total: stats.total_workers,
        dispatched: stats.dispatched,
        requeued: stats.requeued,
    }
}
