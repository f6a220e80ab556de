//! HTTP API handlers for opost-hub

pub mod auth;
pub mod codes;
pub mod couriers;
pub mod health;
pub mod scan;
pub mod tasks;

pub use auth::auth_middleware;
pub use codes::{bind_code, code_history, get_code, issue_batch, issue_code};
pub use couriers::{
    appoint_courier, find_responsible, freeze_courier, get_courier, list_subordinates,
};
pub use health::health_routes;
pub use scan::process_scan;
pub use tasks::{claim_task, get_task, list_tasks};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use opost_common::Error;
use serde_json::json;

/// Error wrapper mapping domain errors onto HTTP statuses.
///
/// Lost CAS races and duplicates are 409 so clients can distinguish "retry
/// or refetch" from hard rejections.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::CodeNotFound(_) | Error::TaskNotFound(_) | Error::CourierNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::AlreadyBound(_)
            | Error::AlreadyAssigned(_)
            | Error::ConcurrentModification(_) => StatusCode::CONFLICT,
            Error::InvalidSignature(_)
            | Error::InvalidTransition(_)
            | Error::InvalidOpCode(_)
            | Error::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error on API path");
        }

        let body = Json(json!({
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
