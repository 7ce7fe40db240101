//! The booking store: the only shared mutable state in the system.
//!
//! Everything that must be atomic is a single trait method, so the engine
//! never performs a read-then-write across two store calls.

mod wal_store;

pub use wal_store::{SharedCourtState, WalStore};

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("court {0} not found")]
    CourtNotFound(CourtId),
    #[error("court {0} already exists")]
    CourtExists(CourtId),
    #[error("court {court_id} is referenced by {bookings} booking(s)")]
    CourtInUse { court_id: CourtId, bookings: usize },
    /// Returned by `insert_booking_if_free` with the id of the booking in the way.
    #[error("overlaps booking {0}")]
    Overlap(BookingId),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("inconsistent state: {0}")]
    Corrupt(String),
}

/// Result of the compare-and-set on `used_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInTransition {
    /// `used_at` was null and is now set.
    Applied(Booking),
    /// `used_at` was already set; nothing changed.
    AlreadyUsed(Booking),
    UnknownToken,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Create a court. `id = None` assigns the next free id.
    async fn create_court(&self, id: Option<CourtId>, name: String) -> Result<Court, StoreError>;

    async fn rename_court(&self, id: CourtId, name: String) -> Result<Court, StoreError>;

    /// Delete a court. Fails with `CourtInUse` while any booking references it.
    async fn delete_court(&self, id: CourtId) -> Result<Court, StoreError>;

    async fn court(&self, id: CourtId) -> Result<Option<Court>, StoreError>;

    /// All courts, ascending by id.
    async fn courts(&self) -> Result<Vec<Court>, StoreError>;

    /// Bookings on one court-day, ascending by start hour. Unknown courts have none.
    async fn bookings_on(&self, court_id: CourtId, date: NaiveDate) -> Result<Vec<Booking>, StoreError>;

    /// Overlap check and insert as one atomic step. The loser of a race for
    /// the same slot gets `Overlap`.
    async fn insert_booking_if_free(&self, draft: BookingDraft) -> Result<Booking, StoreError>;

    /// Exact, indexed token lookup.
    async fn booking_by_token(&self, token: &Token) -> Result<Option<Booking>, StoreError>;

    /// Set `used_at = now` only if it is currently null.
    async fn mark_used_if_pending(&self, token: &Token, now: Ms) -> Result<CheckInTransition, StoreError>;

    /// Bookings matching `query`, in no particular order.
    async fn scan_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>, StoreError>;
}
