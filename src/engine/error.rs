use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, Status};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval [{start}, {end}): end must be after start")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("equipment unavailable: {0}")]
    EquipmentUnavailable(Ulid),
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },
    #[error("invalid status: {0:?}")]
    InvalidStatus(String),
    #[error("forbidden")]
    Forbidden,
    #[error("reservation {0} already has a review")]
    DuplicateReview(Ulid),
    #[error("reservation {id} is {status}; fields can no longer be edited")]
    Finalized { id: Ulid, status: Status },
    #[error("cannot delete reservation {0}: a review references it")]
    HasReview(Ulid),
    #[error("review not allowed: reservation {id} is {status}")]
    IneligibleStatus { id: Ulid, status: Status },
    #[error("rating {0} out of range 1..=5")]
    InvalidRating(u8),
    #[error("invalid sort key: {0:?}")]
    InvalidSort(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::EquipmentUnavailable(_) => "equipment_unavailable",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::Forbidden => "forbidden",
            EngineError::DuplicateReview(_) => "duplicate_review",
            EngineError::Finalized { .. } => "finalized",
            EngineError::HasReview(_) => "has_review",
            EngineError::IneligibleStatus { .. } => "ineligible_status",
            EngineError::InvalidRating(_) => "invalid_rating",
            EngineError::InvalidSort(_) => "invalid_sort",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "unavailable",
        }
    }

    /// Infrastructure failures; everything else is the caller's input.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}
