//! Event types and EventBus for the OPost event system
//!
//! Events are broadcast via the EventBus and consumed by external credit
//! and notification subsystems. The hub emits them at every lifecycle
//! boundary; nothing inside the hub blocks on a subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::models::CourierTier;

/// OPost event types
///
/// Serialized with a `type` tag so external consumers can dispatch without
/// exhaustive knowledge of every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpostEvent {
    /// A signed delivery code was issued
    CodeIssued {
        code_id: String,
        issuer_id: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A code was bound to a sender/recipient route (one-time)
    CodeBound {
        code_id: String,
        recipient_op_code: String,
        sender_op_code: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The expiry sweep retired a code that was never delivered
    CodeExpired {
        code_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A delivery task was created from a bound code
    TaskCreated {
        task_id: String,
        code_id: String,
        pickup_op_code: String,
        delivery_op_code: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A courier claimed a task
    TaskClaimed {
        task_id: String,
        courier_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Pickup scan accepted; letter is moving
    TaskInTransit {
        task_id: String,
        courier_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Delivery scan accepted; consumed by the external credit ledger
    TaskCompleted {
        task_id: String,
        courier_id: String,
        points: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Task failed; surfaced to operators, never silently dropped
    TaskFailed {
        task_id: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The escalation sweep bumped an unclaimed task one tier up
    TaskEscalated {
        task_id: String,
        from_tier: CourierTier,
        to_tier: CourierTier,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Signature verification failed for a code; operator-visible
    SecurityAlert {
        code_id: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A new subordinate courier was appointed
    CourierAppointed {
        courier_id: String,
        appointed_by: String,
        tier: CourierTier,
        zone_code: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A courier was soft-frozen
    CourierFrozen {
        courier_id: String,
        frozen_by: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl OpostEvent {
    /// Event type as string for filtering and logging
    pub fn event_type(&self) -> &str {
        match self {
            OpostEvent::CodeIssued { .. } => "CodeIssued",
            OpostEvent::CodeBound { .. } => "CodeBound",
            OpostEvent::CodeExpired { .. } => "CodeExpired",
            OpostEvent::TaskCreated { .. } => "TaskCreated",
            OpostEvent::TaskClaimed { .. } => "TaskClaimed",
            OpostEvent::TaskInTransit { .. } => "TaskInTransit",
            OpostEvent::TaskCompleted { .. } => "TaskCompleted",
            OpostEvent::TaskFailed { .. } => "TaskFailed",
            OpostEvent::TaskEscalated { .. } => "TaskEscalated",
            OpostEvent::SecurityAlert { .. } => "SecurityAlert",
            OpostEvent::CourierAppointed { .. } => "CourierAppointed",
            OpostEvent::CourierFrozen { .. } => "CourierFrozen",
        }
    }
}

/// Central event distribution bus
///
/// Wraps tokio::broadcast: non-blocking publish, multiple concurrent
/// subscribers, automatic cleanup when subscribers drop. Downstream credit
/// and notification consumers subscribe here.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OpostEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<OpostEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; Err when no subscriber is listening
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: OpostEvent) -> Result<usize, broadcast::error::SendError<OpostEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case. Used for events the
    /// hub must not fail on (everything except its own invariants).
    pub fn emit_lossy(&self, event: OpostEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
