//! Scan-Event Processor
//!
//! Single entry point for courier scans. Each scan runs the same pipeline:
//! signature check, idempotent-replay check, permission check, transition
//! check, then one transaction that advances the code and the task together
//! and appends the audit row. Every step that mutates state is a conditional
//! UPDATE checked by rows_affected, so two racing scans can never both win.

use chrono::Utc;
use opost_common::db::models::{
    CodeStatus, CourierStatus, DeliveryCode, DeliveryTask, ScanAction, TaskStatus,
};
use opost_common::events::{EventBus, OpostEvent};
use opost_common::opcode::zone_covers;
use opost_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::hierarchy::HierarchyRegistry;
use crate::lifecycle::CodeLifecycle;

/// Base credit for a completed delivery; priority adds on top
const BASE_POINTS: i64 = 10;

/// A scan as reported by a courier client
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub code: String,
    pub signature: String,
    pub courier_id: String,
    pub action: ScanAction,
    pub location: Option<String>,
}

/// What a scan did. Serialized into the audit row and replayed verbatim
/// when the same scan arrives again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub scan_id: String,
    pub task_id: String,
    pub code_status: CodeStatus,
    pub task_status: TaskStatus,
    /// True when this response was served from an earlier accepted scan
    #[serde(default)]
    pub replay: bool,
}

#[derive(Clone)]
pub struct ScanProcessor {
    db: SqlitePool,
    lifecycle: CodeLifecycle,
    registry: HierarchyRegistry,
    events: EventBus,
}

impl ScanProcessor {
    pub fn new(
        db: SqlitePool,
        lifecycle: CodeLifecycle,
        registry: HierarchyRegistry,
        events: EventBus,
    ) -> Self {
        Self { db, lifecycle, registry, events }
    }

    pub async fn history(&self, code_id: &str) -> Result<Vec<opost_common::db::models::ScanEvent>> {
        Ok(sqlx::query_as(
            "SELECT * FROM scan_events WHERE code_id = ? ORDER BY created_at ASC",
        )
        .bind(code_id)
        .fetch_all(&self.db)
        .await?)
    }

    /// Process one scan end to end.
    pub async fn process_scan(&self, req: &ScanRequest) -> Result<ScanOutcome> {
        let code = self.lifecycle.get_by_code(&req.code).await?;
        let courier = self.registry.get(&req.courier_id).await?;

        // A forged signature burns the code regardless of who scanned it
        if !self.lifecycle.verify_signature(&code, &req.signature) {
            self.record_rejected(&code, req).await?;
            self.lifecycle.mark_invalid(&code.id, "scan signature mismatch").await?;
            return Err(Error::InvalidSignature(code.code.clone()));
        }

        // Replay of an already-accepted scan: answer from the audit row,
        // mutate nothing
        if let Some(cached) = self.cached_outcome(&code.id, req.action).await? {
            info!(code_id = %code.id, action = %req.action, "duplicate scan replayed");
            return Ok(cached);
        }

        if courier.status != CourierStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "courier {} is not active",
                courier.id
            )));
        }

        let task = self.task_for_code(&code.id).await?;
        self.check_permission(&courier, &task, req.action)?;

        let (code_from, code_to, task_from, task_to) = match req.action {
            ScanAction::Pickup => (
                CodeStatus::Bound,
                CodeStatus::InTransit,
                TaskStatus::Assigned,
                TaskStatus::PickedUp,
            ),
            ScanAction::Delivery => (
                CodeStatus::InTransit,
                CodeStatus::Delivered,
                TaskStatus::PickedUp,
                TaskStatus::Delivered,
            ),
        };

        if code.status != code_from || task.status != task_from {
            return Err(Error::InvalidTransition(format!(
                "{} scan on code in {:?} / task in {:?}",
                req.action, code.status, task.status
            )));
        }

        let outcome = self
            .commit_scan(&code, &task, req, code_from, code_to, task_from, task_to)
            .await?;

        match req.action {
            ScanAction::Pickup => self.events.emit_lossy(OpostEvent::TaskInTransit {
                task_id: task.id.clone(),
                courier_id: req.courier_id.clone(),
                timestamp: Utc::now(),
            }),
            ScanAction::Delivery => self.events.emit_lossy(OpostEvent::TaskCompleted {
                task_id: task.id.clone(),
                courier_id: req.courier_id.clone(),
                points: BASE_POINTS + task.priority,
                timestamp: Utc::now(),
            }),
        }

        Ok(outcome)
    }

    /// Pickup is restricted to the courier holding the claim. Delivery is
    /// accepted from the carrying courier or from any active courier whose
    /// zone covers the destination (the receiving side signs letters in).
    fn check_permission(
        &self,
        courier: &opost_common::db::models::CourierProfile,
        task: &DeliveryTask,
        action: ScanAction,
    ) -> Result<()> {
        let is_assignee = task.assigned_courier_id.as_deref() == Some(courier.id.as_str());
        let allowed = match action {
            ScanAction::Pickup => is_assignee,
            ScanAction::Delivery => {
                is_assignee || zone_covers(&courier.zone_code, &task.delivery_op_code)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "courier {} may not record {} for task {}",
                courier.id, action, task.id
            )))
        }
    }

    /// Advance code and task in one transaction and append the audit row.
    /// Both CAS updates must hit exactly one row; otherwise another scan got
    /// there first and this one rolls back.
    #[allow(clippy::too_many_arguments)]
    async fn commit_scan(
        &self,
        code: &DeliveryCode,
        task: &DeliveryTask,
        req: &ScanRequest,
        code_from: CodeStatus,
        code_to: CodeStatus,
        task_from: TaskStatus,
        task_to: TaskStatus,
    ) -> Result<ScanOutcome> {
        let scan_id = Uuid::new_v4().to_string();
        let outcome = ScanOutcome {
            scan_id: scan_id.clone(),
            task_id: task.id.clone(),
            code_status: code_to,
            task_status: task_to,
            replay: false,
        };
        let serialized = serde_json::to_string(&outcome)
            .map_err(|e| Error::Internal(format!("outcome serialization: {}", e)))?;

        let mut tx = self.db.begin().await?;

        let updated = sqlx::query(
            "UPDATE delivery_codes SET status = ?, scan_count = scan_count + 1
             WHERE id = ? AND status = ?",
        )
        .bind(code_to)
        .bind(&code.id)
        .bind(code_from)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(Error::ConcurrentModification(code.id.clone()));
        }

        let updated = sqlx::query(
            "UPDATE delivery_tasks SET status = ?
             WHERE id = ? AND status = ? AND assigned_courier_id IS NOT NULL",
        )
        .bind(task_to)
        .bind(&task.id)
        .bind(task_from)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(Error::ConcurrentModification(task.id.clone()));
        }

        // The partial unique index on (code_id, action) for accepted rows is
        // the last line of defence against two scans racing past the checks
        let inserted = sqlx::query(
            "INSERT INTO scan_events
                (id, code_id, courier_id, action, signature_valid, accepted, result, location, created_at)
             VALUES (?, ?, ?, ?, 1, 1, ?, ?, ?)",
        )
        .bind(&scan_id)
        .bind(&code.id)
        .bind(&req.courier_id)
        .bind(req.action)
        .bind(&serialized)
        .bind(&req.location)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Err(Error::ConcurrentModification(code.id.clone()));
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// The accepted audit row for this (code, action), if one exists
    async fn cached_outcome(
        &self,
        code_id: &str,
        action: ScanAction,
    ) -> Result<Option<ScanOutcome>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT result FROM scan_events
             WHERE code_id = ? AND action = ? AND accepted = 1",
        )
        .bind(code_id)
        .bind(action)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some((Some(serialized),)) => {
                let mut outcome: ScanOutcome = serde_json::from_str(&serialized)
                    .map_err(|e| Error::Internal(format!("outcome deserialization: {}", e)))?;
                outcome.replay = true;
                Ok(Some(outcome))
            }
            Some((None,)) => Err(Error::Internal(format!(
                "accepted scan for code {} has no stored result",
                code_id
            ))),
            None => Ok(None),
        }
    }

    /// Append a rejected-signature audit row; never advances any state
    async fn record_rejected(&self, code: &DeliveryCode, req: &ScanRequest) -> Result<()> {
        warn!(code_id = %code.id, courier_id = %req.courier_id, "scan with invalid signature");
        sqlx::query(
            "INSERT INTO scan_events
                (id, code_id, courier_id, action, signature_valid, accepted, result, location, created_at)
             VALUES (?, ?, ?, ?, 0, 0, NULL, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&code.id)
        .bind(&req.courier_id)
        .bind(req.action)
        .bind(&req.location)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn task_for_code(&self, code_id: &str) -> Result<DeliveryTask> {
        sqlx::query_as::<_, DeliveryTask>("SELECT * FROM delivery_tasks WHERE code_id = ?")
            .bind(code_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::TaskNotFound(format!("code {}", code_id)))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}
