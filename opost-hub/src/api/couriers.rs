//! Courier hierarchy endpoints: appoint, freeze, inspect

use axum::extract::{Path, State};
use axum::Json;
use opost_common::db::models::{CourierProfile, CourierTier};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AppointRequest {
    pub actor_id: String,
    pub tier: CourierTier,
    pub zone_code: String,
}

/// POST /api/couriers — appoint a subordinate courier
pub async fn appoint_courier(
    State(state): State<AppState>,
    Json(req): Json<AppointRequest>,
) -> Result<Json<CourierProfile>, ApiError> {
    Ok(Json(
        state
            .registry
            .create_subordinate(&req.actor_id, req.tier, &req.zone_code)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct FreezeRequest {
    pub actor_id: String,
    pub target_id: String,
}

/// POST /api/couriers/freeze — soft de-provisioning
pub async fn freeze_courier(
    State(state): State<AppState>,
    Json(req): Json<FreezeRequest>,
) -> Result<Json<Value>, ApiError> {
    state.registry.freeze(&req.actor_id, &req.target_id).await?;
    Ok(Json(json!({ "frozen": req.target_id })))
}

#[derive(Debug, Deserialize)]
pub struct ResponsibleQuery {
    pub op_code: String,
}

/// GET /api/couriers/responsible?op_code=… — narrowest active courier
/// covering an address, longest prefix first
pub async fn find_responsible(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<ResponsibleQuery>,
) -> Result<Json<Option<CourierProfile>>, ApiError> {
    Ok(Json(state.registry.find_responsible(&q.op_code).await?))
}

/// GET /api/couriers/:id
pub async fn get_courier(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CourierProfile>, ApiError> {
    Ok(Json(state.registry.get(&id).await?))
}

/// GET /api/couriers/:id/subordinates
pub async fn list_subordinates(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CourierProfile>>, ApiError> {
    Ok(Json(state.registry.list_subordinates(&id).await?))
}
