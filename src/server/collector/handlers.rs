use crate::server::{
    config::AppState,
    planner::types::ScanConfig,
    shared::types::{
        api::{ApiError, ApiResult},
        users::UserId,
    },
    tasks::service::{CancelOutcome, Task, TaskStatus},
};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/scan", post(start_scan))
        .route("/scan/cancel", post(cancel_scan))
        .route("/config", get(get_config).put(put_config))
        .route("/tasks/{task_id}", get(get_task))
}

#[derive(Debug, Serialize)]
struct StartScanResponse {
    task_id: Uuid,
    status: TaskStatus,
}

/// Start a scan from the caller's stored configuration
async fn start_scan(
    State(state): State<Arc<AppState>>,
    user: UserId,
) -> ApiResult<Json<StartScanResponse>> {
    let task = state.services.collector_service.start_scan(&user.0).await?;

    Ok(Json(StartScanResponse {
        task_id: task.task_id,
        status: task.status,
    }))
}

#[derive(Debug, Deserialize)]
struct CancelScanRequest {
    task_id: Uuid,
}

#[derive(Debug, Serialize)]
struct CancelScanResponse {
    status: CancelOutcome,
}

/// Request cancellation of a running scan
async fn cancel_scan(
    State(state): State<Arc<AppState>>,
    _user: UserId,
    Json(request): Json<CancelScanRequest>,
) -> (StatusCode, Json<CancelScanResponse>) {
    let outcome = state
        .services
        .collector_service
        .cancel_scan(&request.task_id)
        .await;

    let status = match outcome {
        CancelOutcome::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    (status, Json(CancelScanResponse { status: outcome }))
}

/// Snapshot read of one task
async fn get_task(
    State(state): State<Arc<AppState>>,
    _user: UserId,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    let task = state
        .services
        .collector_service
        .get_task(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Task '{task_id}' not found")))?;

    Ok(Json(task))
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    user: UserId,
) -> ApiResult<Json<ScanConfig>> {
    let config = state.services.collector_service.get_config(&user.0).await?;
    Ok(Json(config))
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Json(config): Json<ScanConfig>,
) -> ApiResult<Json<ScanConfig>> {
    let stored = state
        .services
        .collector_service
        .put_config(&user.0, config)
        .await?;
    Ok(Json(stored))
}
