mod availability;
mod error;
mod mutations;
mod queries;
pub mod validate;

#[cfg(test)]
mod tests;

pub use availability::{SLOT_HOURS, compute_availability};
pub use error::{EngineError, ErrorKind};

use std::sync::Arc;

use crate::model::Ms;
use crate::store::BookingStore;

/// Rules applied to new bookings on top of the hour domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Reject bookings outside 07:00–22:00.
    pub enforce_opening_hours: bool,
}

/// Availability engine and booking lifecycle manager.
///
/// Stateless apart from its store: every read goes to the store, and every
/// racy step (overlap-then-insert, check-in) is a single store primitive.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    policy: BookingPolicy,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, policy: BookingPolicy) -> Self {
        Self { store, policy }
    }
}

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}
