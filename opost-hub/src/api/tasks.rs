//! Task endpoints: browse the claimable pool, claim, inspect

use axum::extract::{Path, Query, State};
use axum::Json;
use opost_common::db::models::DeliveryTask;
use serde::Deserialize;

use crate::api::ApiError;
use crate::util::retry_on_lock;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub courier_id: String,
}

/// GET /api/tasks?courier_id=… — unclaimed tasks this courier may claim
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<Vec<DeliveryTask>>, ApiError> {
    Ok(Json(state.dispatcher.list_assignable(&q.courier_id).await?))
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryTask>, ApiError> {
    Ok(Json(state.dispatcher.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub courier_id: String,
    pub task_id: String,
}

/// POST /api/tasks/claim — first eligible claimer wins, losers get 409
pub async fn claim_task(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<DeliveryTask>, ApiError> {
    let task = retry_on_lock("claim task", state.settings.max_lock_wait_ms, || {
        state.dispatcher.claim_task(&req.courier_id, &req.task_id)
    })
    .await?;
    Ok(Json(task))
}
