//! Common error types for OPost
//!
//! The delivery-coordination error taxonomy splits into three families:
//! user-correctable authority failures, lost races (retried once by callers),
//! and terminal code-security failures (never retried).

use thiserror::Error;

/// Common result type for OPost operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across OPost services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Actor's tier or zone does not grant the requested operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Delivery code already bound to a route (lost the bind race)
    #[error("Code already bound: {0}")]
    AlreadyBound(String),

    /// Task already claimed by another courier (lost the claim race)
    #[error("Task already assigned: {0}")]
    AlreadyAssigned(String),

    /// Concurrent update raced this one; caller may retry once
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Code signature failed verification; terminal for the code
    #[error("Invalid signature for code: {0}")]
    InvalidSignature(String),

    /// Scan action is not the legal next transition for the code's status
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Delivery code does not exist
    #[error("Code not found: {0}")]
    CodeNotFound(String),

    /// Delivery task does not exist
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Courier does not exist
    #[error("Courier not found: {0}")]
    CourierNotFound(String),

    /// Task unclaimed after exhausting all four courier tiers
    #[error("Escalation exhausted for task: {0}")]
    EscalationExhausted(String),

    /// OP code is malformed or does not resolve to a real zone
    #[error("Invalid OP code: {0}")]
    InvalidOpCode(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by losing a CAS race; callers retry these once.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            Error::AlreadyBound(_) | Error::AlreadyAssigned(_) | Error::ConcurrentModification(_)
        )
    }

    /// True for errors that must additionally raise an operator-visible alert.
    pub fn is_alertable(&self) -> bool {
        matches!(self, Error::InvalidSignature(_) | Error::EscalationExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_race_classification() {
        assert!(Error::AlreadyBound("c".into()).is_lost_race());
        assert!(Error::AlreadyAssigned("t".into()).is_lost_race());
        assert!(Error::ConcurrentModification("x".into()).is_lost_race());
        assert!(!Error::PermissionDenied("p".into()).is_lost_race());
        assert!(!Error::InvalidSignature("c".into()).is_lost_race());
    }

    #[test]
    fn test_alertable_classification() {
        assert!(Error::InvalidSignature("c".into()).is_alertable());
        assert!(Error::EscalationExhausted("t".into()).is_alertable());
        assert!(!Error::AlreadyBound("c".into()).is_alertable());
        assert!(!Error::TaskNotFound("t".into()).is_alertable());
    }
}
