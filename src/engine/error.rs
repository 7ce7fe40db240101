use thiserror::Error;

use crate::model::{BookingId, CourtId, Token};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input, tied to one request field.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("slot already booked (conflicts with booking {0})")]
    Conflict(BookingId),
    #[error("court {court_id} is still referenced by {bookings} booking(s)")]
    CourtInUse { court_id: CourtId, bookings: usize },
    #[error("court {0} already exists")]
    AlreadyExists(CourtId),
    #[error("court {0} not found")]
    CourtNotFound(CourtId),
    #[error("no booking with token {0}")]
    TokenNotFound(Token),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Unexpected store failure, passed through untouched.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Coarse error families, for callers that only care which kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Internal,
}

impl EngineError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict(_) | EngineError::CourtInUse { .. } | EngineError::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            EngineError::CourtNotFound(_) | EngineError::TokenNotFound(_) => ErrorKind::NotFound,
            EngineError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CourtNotFound(id) => EngineError::CourtNotFound(id),
            StoreError::CourtExists(id) => EngineError::AlreadyExists(id),
            StoreError::CourtInUse { court_id, bookings } => EngineError::CourtInUse { court_id, bookings },
            StoreError::Overlap(id) => EngineError::Conflict(id),
            StoreError::LimitExceeded(what) => EngineError::LimitExceeded(what),
            other @ (StoreError::Wal(_) | StoreError::Corrupt(_)) => EngineError::Storage(other.to_string()),
        }
    }
}
