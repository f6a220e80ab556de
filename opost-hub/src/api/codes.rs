//! Delivery-code endpoints: issue, batch issue, bind, inspect

use axum::extract::{Path, State};
use axum::Json;
use opost_common::db::models::{CourierTier, DeliveryCode, DeliveryTask, ScanEvent};
use opost_common::Error;
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::lifecycle::IssuedCode;
use crate::util::retry_on_lock;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    pub issuer_id: Option<String>,
    pub letter_id: Option<String>,
}

/// POST /api/codes — issue one signed code
pub async fn issue_code(
    State(state): State<AppState>,
    Json(req): Json<IssueRequest>,
) -> Result<Json<IssuedCode>, ApiError> {
    let issued = state
        .lifecycle
        .generate_code(req.issuer_id.as_deref(), req.letter_id.as_deref())
        .await?;
    Ok(Json(issued))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub actor_id: String,
    pub zone: String,
    pub count: u32,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub codes: Vec<IssuedCode>,
}

/// Largest batch a zone courier may print at once
const MAX_BATCH: u32 = 1000;

/// POST /api/codes/batch — bulk structured codes for printed stock.
/// Requires Zone-or-above authority over the target zone.
pub async fn issue_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if req.count == 0 || req.count > MAX_BATCH {
        return Err(Error::InvalidInput(format!(
            "batch count {} outside 1..={}",
            req.count, MAX_BATCH
        ))
        .into());
    }
    if !state
        .registry
        .authorize(&req.actor_id, CourierTier::Zone, &req.zone)
        .await?
    {
        return Err(Error::PermissionDenied(format!(
            "courier {} lacks zone authority over {}",
            req.actor_id, req.zone
        ))
        .into());
    }

    let codes = state
        .lifecycle
        .generate_batch(&req.actor_id, &req.zone, req.count)
        .await?;
    Ok(Json(BatchResponse { codes }))
}

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub code: String,
    pub recipient_op_code: String,
    pub sender_op_code: String,
    pub letter_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Serialize)]
pub struct BindResponse {
    pub code: DeliveryCode,
    pub task: DeliveryTask,
}

/// POST /api/codes/bind — one-time bind plus task creation.
///
/// Binding and dispatch are one client-visible step: a successfully bound
/// letter always has a task routed into the hierarchy.
pub async fn bind_code(
    State(state): State<AppState>,
    Json(req): Json<BindRequest>,
) -> Result<Json<BindResponse>, ApiError> {
    let max_wait = state.settings.max_lock_wait_ms;
    let code = retry_on_lock("bind code", max_wait, || {
        state.lifecycle.bind(
            &req.code,
            &req.recipient_op_code,
            &req.sender_op_code,
            req.letter_id.as_deref(),
        )
    })
    .await?;
    let task = retry_on_lock("create task", max_wait, || {
        state.dispatcher.create_task(&code, req.priority)
    })
    .await?;
    Ok(Json(BindResponse { code, task }))
}

/// GET /api/codes/:code
pub async fn get_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<DeliveryCode>, ApiError> {
    Ok(Json(state.lifecycle.get_by_code(&code).await?))
}

/// GET /api/codes/:code/history — full scan audit trail
pub async fn code_history(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Vec<ScanEvent>>, ApiError> {
    let row = state.lifecycle.get_by_code(&code).await?;
    Ok(Json(state.scanner.history(&row.id).await?))
}
