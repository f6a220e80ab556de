//! Scan endpoint

use axum::extract::State;
use axum::Json;

use crate::api::ApiError;
use crate::scan::{ScanOutcome, ScanRequest};
use crate::util::retry_on_lock;
use crate::AppState;

/// POST /api/scan — process a courier scan.
///
/// Transient lock errors are retried with bounded backoff. A scan that
/// loses a CAS race against its own duplicate is retried once; the retry
/// lands on the replay cache and returns the accepted outcome, so
/// double-submitting clients see success rather than a spurious 409.
pub async fn process_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanOutcome>, ApiError> {
    let max_wait = state.settings.max_lock_wait_ms;
    let attempt = retry_on_lock("process scan", max_wait, || {
        state.scanner.process_scan(&req)
    })
    .await;
    match attempt {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) if e.is_lost_race() => {
            let outcome = retry_on_lock("process scan retry", max_wait, || {
                state.scanner.process_scan(&req)
            })
            .await?;
            Ok(Json(outcome))
        }
        Err(e) => Err(e.into()),
    }
}
