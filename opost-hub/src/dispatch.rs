//! Task Dispatcher
//!
//! Creates delivery tasks from bound codes and routes them through the
//! courier hierarchy: the task is offered at the lowest tier with an active
//! zone-matching courier, claimed by CAS on `assigned_courier_id`, and
//! escalated one tier per missed deadline until the City tier is exhausted.

use chrono::{Duration, Utc};
use opost_common::db::models::{
    CourierStatus, CourierTier, DeliveryCode, DeliveryTask, TaskStatus,
};
use opost_common::events::{EventBus, OpostEvent};
use opost_common::opcode::zone_covers;
use opost_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::{error, info};
use uuid::Uuid;

use crate::hierarchy::HierarchyRegistry;

#[derive(Clone)]
pub struct TaskDispatcher {
    db: SqlitePool,
    registry: HierarchyRegistry,
    events: EventBus,
    deadline_secs: i64,
}

/// Outcome summary of one escalation sweep tick
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub escalated: usize,
    pub failed: usize,
    pub released: usize,
}

impl TaskDispatcher {
    pub fn new(
        db: SqlitePool,
        registry: HierarchyRegistry,
        events: EventBus,
        deadline_secs: i64,
    ) -> Self {
        Self { db, registry, events, deadline_secs }
    }

    pub async fn get(&self, task_id: &str) -> Result<DeliveryTask> {
        sqlx::query_as::<_, DeliveryTask>("SELECT * FROM delivery_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    pub async fn get_by_code(&self, code_id: &str) -> Result<DeliveryTask> {
        sqlx::query_as::<_, DeliveryTask>("SELECT * FROM delivery_tasks WHERE code_id = ?")
            .bind(code_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::TaskNotFound(format!("code {}", code_id)))
    }

    /// Create a task from a bound code and route it to its initial tier.
    pub async fn create_task(&self, code: &DeliveryCode, priority: i64) -> Result<DeliveryTask> {
        let (Some(sender), Some(recipient)) =
            (code.sender_op_code.as_deref(), code.recipient_op_code.as_deref())
        else {
            return Err(Error::InvalidInput(format!("code {} is not bound", code.id)));
        };

        let now = Utc::now();
        let task = DeliveryTask {
            id: Uuid::new_v4().to_string(),
            code_id: code.id.clone(),
            assigned_courier_id: None,
            pickup_op_code: sender.to_string(),
            delivery_op_code: recipient.to_string(),
            priority,
            status: TaskStatus::Pending,
            current_tier: CourierTier::Building,
            created_at: now,
            escalation_deadline: now + Duration::seconds(self.deadline_secs),
        };

        sqlx::query(
            "INSERT INTO delivery_tasks
                (id, code_id, assigned_courier_id, pickup_op_code, delivery_op_code,
                 priority, status, current_tier, created_at, escalation_deadline)
             VALUES (?, ?, NULL, ?, ?, ?, 'pending', ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.code_id)
        .bind(&task.pickup_op_code)
        .bind(&task.delivery_op_code)
        .bind(task.priority)
        .bind(task.current_tier)
        .bind(task.created_at)
        .bind(task.escalation_deadline)
        .execute(&self.db)
        .await?;

        self.events.emit_lossy(OpostEvent::TaskCreated {
            task_id: task.id.clone(),
            code_id: task.code_id.clone(),
            pickup_op_code: task.pickup_op_code.clone(),
            delivery_op_code: task.delivery_op_code.clone(),
            timestamp: now,
        });

        self.assign_task(&task.id).await
    }

    /// Route a task to the lowest tier holding an active courier whose zone
    /// covers the pickup address. Walking the four tiers is deterministic
    /// and bounded; with no eligible courier anywhere, the task fails
    /// immediately rather than sitting unroutable.
    pub async fn assign_task(&self, task_id: &str) -> Result<DeliveryTask> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() || task.assigned_courier_id.is_some() {
            return Ok(task);
        }

        let mut tier = Some(task.current_tier);
        while let Some(t) = tier {
            if self
                .registry
                .find_at_tier(&task.pickup_op_code, t)
                .await?
                .is_some()
            {
                if t != task.current_tier {
                    sqlx::query(
                        "UPDATE delivery_tasks SET current_tier = ?
                         WHERE id = ? AND assigned_courier_id IS NULL",
                    )
                    .bind(t)
                    .bind(task_id)
                    .execute(&self.db)
                    .await?;
                }
                return self.get(task_id).await;
            }
            tier = t.parent();
        }

        // No active courier at any tier covers the pickup zone
        self.fail_task(task_id, "no eligible courier for pickup zone").await?;
        self.get(task_id).await
    }

    /// Claim a task: CAS on `assigned_courier_id` NULL → courier. Only a
    /// courier at or above the task's current offer tier, with zone
    /// authority over the pickup address, may claim.
    pub async fn claim_task(&self, courier_id: &str, task_id: &str) -> Result<DeliveryTask> {
        let task = self.get(task_id).await?;
        let courier = self.registry.get(courier_id).await?;

        if courier.status != CourierStatus::Active
            || courier.tier < task.current_tier
            || !zone_covers(&courier.zone_code, &task.pickup_op_code)
        {
            return Err(Error::PermissionDenied(format!(
                "courier {} may not claim task {}",
                courier_id, task_id
            )));
        }

        let result = sqlx::query(
            "UPDATE delivery_tasks SET assigned_courier_id = ?, status = 'assigned'
             WHERE id = ? AND assigned_courier_id IS NULL
               AND status IN ('pending', 'escalated')",
        )
        .bind(courier_id)
        .bind(task_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::AlreadyAssigned(task_id.to_string()));
        }

        self.events.emit_lossy(OpostEvent::TaskClaimed {
            task_id: task_id.to_string(),
            courier_id: courier_id.to_string(),
            timestamp: Utc::now(),
        });
        self.get(task_id).await
    }

    /// Unclaimed tasks visible to this courier: offered at or below the
    /// courier's tier, pickup zone inside the courier's zone.
    pub async fn list_assignable(&self, courier_id: &str) -> Result<Vec<DeliveryTask>> {
        let courier = self.registry.get(courier_id).await?;
        if courier.status != CourierStatus::Active {
            return Ok(Vec::new());
        }

        let candidates = sqlx::query_as::<_, DeliveryTask>(
            "SELECT * FROM delivery_tasks
             WHERE assigned_courier_id IS NULL
               AND status IN ('pending', 'escalated')
               AND current_tier <= ?
             ORDER BY priority DESC, created_at ASC",
        )
        .bind(courier.tier)
        .fetch_all(&self.db)
        .await?;

        Ok(candidates
            .into_iter()
            .filter(|t| zone_covers(&courier.zone_code, &t.pickup_op_code))
            .collect())
    }

    /// Escalation sweep. Each overdue unclaimed task is bumped exactly one
    /// tier per deadline breach (the deadline guard in the UPDATE makes a
    /// concurrent double-bump impossible); a task overdue at City tier fails
    /// exactly once and is reported outward. Tasks claimed by a courier
    /// that has since been frozen are released and re-offered one tier up.
    pub async fn escalation_sweep(&self) -> Result<SweepStats> {
        let now = Utc::now();
        let mut stats = SweepStats::default();

        let overdue = sqlx::query_as::<_, DeliveryTask>(
            "SELECT * FROM delivery_tasks
             WHERE assigned_courier_id IS NULL
               AND status IN ('pending', 'escalated')
               AND escalation_deadline < ?",
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        for task in overdue {
            match task.current_tier.parent() {
                Some(next_tier) => {
                    let result = sqlx::query(
                        "UPDATE delivery_tasks
                         SET current_tier = ?, status = 'escalated', escalation_deadline = ?
                         WHERE id = ? AND assigned_courier_id IS NULL
                           AND status IN ('pending', 'escalated')
                           AND escalation_deadline = ?",
                    )
                    .bind(next_tier)
                    .bind(now + Duration::seconds(self.deadline_secs))
                    .bind(&task.id)
                    .bind(task.escalation_deadline)
                    .execute(&self.db)
                    .await?;

                    if result.rows_affected() > 0 {
                        stats.escalated += 1;
                        info!(
                            task_id = %task.id,
                            from = ?task.current_tier,
                            to = ?next_tier,
                            "task escalated"
                        );
                        self.events.emit_lossy(OpostEvent::TaskEscalated {
                            task_id: task.id.clone(),
                            from_tier: task.current_tier,
                            to_tier: next_tier,
                            timestamp: now,
                        });
                    }
                }
                None => {
                    if self
                        .fail_task(&task.id, "escalation exhausted at city tier")
                        .await?
                    {
                        stats.failed += 1;
                    }
                }
            }
        }

        // Claims held by couriers frozen since claiming: release and
        // re-offer a tier up (capped at City). Picked-up letters stay with
        // their courier; only un-started claims are recalled.
        let orphaned = sqlx::query_as::<_, DeliveryTask>(
            "SELECT t.* FROM delivery_tasks t
             JOIN couriers c ON c.id = t.assigned_courier_id
             WHERE t.status = 'assigned' AND c.status = 'frozen'",
        )
        .fetch_all(&self.db)
        .await?;

        for task in orphaned {
            let next_tier = task.current_tier.parent().unwrap_or(CourierTier::City);
            let result = sqlx::query(
                "UPDATE delivery_tasks
                 SET assigned_courier_id = NULL, status = 'escalated',
                     current_tier = ?, escalation_deadline = ?
                 WHERE id = ? AND assigned_courier_id = ? AND status = 'assigned'",
            )
            .bind(next_tier)
            .bind(now + Duration::seconds(self.deadline_secs))
            .bind(&task.id)
            .bind(&task.assigned_courier_id)
            .execute(&self.db)
            .await?;

            if result.rows_affected() > 0 {
                stats.released += 1;
                self.events.emit_lossy(OpostEvent::TaskEscalated {
                    task_id: task.id.clone(),
                    from_tier: task.current_tier,
                    to_tier: next_tier,
                    timestamp: now,
                });
            }
        }

        Ok(stats)
    }

    /// Fail a task exactly once; the event is the operator-visible report.
    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delivery_tasks SET status = 'failed'
             WHERE id = ? AND status NOT IN ('delivered', 'failed')",
        )
        .bind(task_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        error!(task_id, reason, "delivery task failed");
        self.events.emit_lossy(OpostEvent::TaskFailed {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(true)
    }
}
