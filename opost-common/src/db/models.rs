//! Database models
//!
//! Entity ownership follows component boundaries: couriers belong to the
//! Hierarchy Registry, delivery_codes to the Code Lifecycle Manager,
//! delivery_tasks to the Task Dispatcher, scan_events to the Scan-Event
//! Processor. Components read each other's entities but only mutate their
//! own.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Courier authority tier, lowest (building/shop) to highest (city).
///
/// A closed enum with an explicit ordering: each tier manages the tier below
/// within its zone. No string-keyed role dispatch anywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
pub enum CourierTier {
    Building = 1,
    Zone = 2,
    School = 3,
    City = 4,
}

impl CourierTier {
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            1 => Ok(CourierTier::Building),
            2 => Ok(CourierTier::Zone),
            3 => Ok(CourierTier::School),
            4 => Ok(CourierTier::City),
            other => Err(Error::InvalidInput(format!("invalid courier tier: {}", other))),
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Next tier up, None at City (the escalation ceiling)
    pub fn parent(self) -> Option<CourierTier> {
        match self {
            CourierTier::Building => Some(CourierTier::Zone),
            CourierTier::Zone => Some(CourierTier::School),
            CourierTier::School => Some(CourierTier::City),
            CourierTier::City => None,
        }
    }
}

/// Courier account status. Couriers are never hard-deleted; de-provisioning
/// freezes the account so historical task and audit references stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CourierStatus {
    Active,
    Pending,
    Frozen,
}

/// Delivery-code lifecycle state.
///
/// `Delivered`, `Expired` and `Invalid` are terminal; status never regresses
/// out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    Unbound,
    Bound,
    InTransit,
    Delivered,
    Expired,
    Invalid,
}

impl CodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CodeStatus::Delivered | CodeStatus::Expired | CodeStatus::Invalid)
    }
}

/// Delivery-task state. Terminal on `Delivered`/`Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    PickedUp,
    Delivered,
    Escalated,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Delivered | TaskStatus::Failed)
    }
}

/// Scan action reported by a courier client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    Pickup,
    Delivery,
}

impl std::fmt::Display for ScanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanAction::Pickup => f.write_str("pickup"),
            ScanAction::Delivery => f.write_str("delivery"),
        }
    }
}

/// A courier in the four-tier hierarchy
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourierProfile {
    pub id: String,
    pub tier: CourierTier,
    pub zone_code: String,
    /// Owning higher-tier courier; null only at City tier
    pub parent_id: Option<String>,
    pub status: CourierStatus,
    /// Read-only mirror of the external credit ledger
    pub points: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A single-use signed delivery code
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryCode {
    pub id: String,
    /// Public token presented by clients
    pub code: String,
    /// HMAC-SHA256 over code + issue time, hex; never derivable client-side
    pub signature: String,
    pub status: CodeStatus,
    pub recipient_op_code: Option<String>,
    pub sender_op_code: Option<String>,
    pub letter_id: Option<String>,
    pub issuer_id: Option<String>,
    /// Issue instant in Unix epoch milliseconds (signature input)
    pub issued_at_ms: i64,
    pub bound_at: Option<chrono::DateTime<chrono::Utc>>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Accepted scans only; duplicate replays do not increment
    pub scan_count: i64,
}

/// A delivery task routed through the courier hierarchy
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: String,
    pub code_id: String,
    /// Null until claimed
    pub assigned_courier_id: Option<String>,
    pub pickup_op_code: String,
    pub delivery_op_code: String,
    pub priority: i64,
    pub status: TaskStatus,
    /// Tier the task is currently offered at; rises on escalation
    pub current_tier: CourierTier,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub escalation_deadline: chrono::DateTime<chrono::Utc>,
}

/// Append-only audit record of a courier scan; never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanEvent {
    pub id: String,
    pub code_id: String,
    pub courier_id: String,
    pub action: ScanAction,
    pub signature_valid: bool,
    /// Whether the scan advanced state. Replays of an accepted scan are
    /// answered from the accepted row and never inserted again.
    pub accepted: bool,
    /// Serialized outcome, replayed verbatim for idempotent duplicates
    pub result: Option<String>,
    pub location: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_and_parent_chain() {
        assert!(CourierTier::City > CourierTier::School);
        assert!(CourierTier::School > CourierTier::Zone);
        assert!(CourierTier::Zone > CourierTier::Building);

        assert_eq!(CourierTier::Building.parent(), Some(CourierTier::Zone));
        assert_eq!(CourierTier::Zone.parent(), Some(CourierTier::School));
        assert_eq!(CourierTier::School.parent(), Some(CourierTier::City));
        assert_eq!(CourierTier::City.parent(), None);
    }

    #[test]
    fn test_tier_from_i64() {
        assert_eq!(CourierTier::from_i64(1).unwrap(), CourierTier::Building);
        assert_eq!(CourierTier::from_i64(4).unwrap(), CourierTier::City);
        assert!(CourierTier::from_i64(0).is_err());
        assert!(CourierTier::from_i64(5).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(CodeStatus::Delivered.is_terminal());
        assert!(CodeStatus::Expired.is_terminal());
        assert!(CodeStatus::Invalid.is_terminal());
        assert!(!CodeStatus::Unbound.is_terminal());
        assert!(!CodeStatus::Bound.is_terminal());
        assert!(!CodeStatus::InTransit.is_terminal());

        assert!(TaskStatus::Delivered.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Escalated.is_terminal());
    }
}
