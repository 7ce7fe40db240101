use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unix milliseconds. The only timestamp type.
pub type Ms = i64;
pub type CourtId = i32;
pub type BookingId = i64;
/// Hour of day. A slot `h` covers `[h:00, h+1:00)`.
pub type Hour = i32;

pub const PRICE_PER_HOUR: i64 = 20;
/// First bookable slot.
pub const OPENING_HOUR: Hour = 7;
/// Latest allowed end of a booking inside the opening window.
pub const CLOSING_HOUR: Hour = 22;

/// Half-open hour range `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: Hour,
    pub end: Hour,
}

impl HourRange {
    pub fn new(start: Hour, end: Hour) -> Self {
        debug_assert!(start < end, "HourRange start must be before end");
        Self { start, end }
    }

    pub fn hours(&self) -> Hour {
        self.end - self.start
    }

    /// Touching ranges (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &HourRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_hour(&self, h: Hour) -> bool {
        self.start <= h && h < self.end
    }
}

/// Opaque check-in credential. Rendered and accepted only as a lowercase,
/// hyphenated UUIDv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(Uuid);

impl Token {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the canonical string form. Uppercase, braced, URN and
    /// non-v4 forms are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let uuid = Uuid::try_parse(s).ok()?;
        if uuid.get_version_num() != 4 {
            return None;
        }
        if uuid.hyphenated().to_string() != s {
            return None;
        }
        Some(Self(uuid))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: CourtId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingState {
    Pending,
    Used,
}

impl BookingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingState::Pending => "pending",
            BookingState::Used => "used",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub court_id: CourtId,
    pub date: NaiveDate,
    pub hours: HourRange,
    pub people_count: i32,
    pub total_price: i64,
    pub token: Token,
    pub created_at: Ms,
    /// `None` while pending; set exactly once by check-in.
    pub used_at: Option<Ms>,
}

impl Booking {
    pub fn state(&self) -> BookingState {
        match self.used_at {
            None => BookingState::Pending,
            Some(_) => BookingState::Used,
        }
    }
}

/// A booking the store has not yet assigned an id to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub court_id: CourtId,
    pub date: NaiveDate,
    pub hours: HourRange,
    pub people_count: i32,
    pub total_price: i64,
    pub token: Token,
    pub created_at: Ms,
}

impl BookingDraft {
    pub fn into_booking(self, id: BookingId) -> Booking {
        Booking {
            id,
            court_id: self.court_id,
            date: self.date,
            hours: self.hours,
            people_count: self.people_count,
            total_price: self.total_price,
            token: self.token,
            created_at: self.created_at,
            used_at: None,
        }
    }
}

/// Everything the store holds for one court. Guarded by a single lock so the
/// overlap check and the insert happen under the same write guard.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub court: Court,
    /// Set when the court is deleted, so a writer holding a stale handle backs off.
    pub retired: bool,
    /// Bookings per day, each day sorted by `hours.start`.
    pub days: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl CourtState {
    pub fn new(court: Court) -> Self {
        Self {
            court,
            retired: false,
            days: BTreeMap::new(),
        }
    }

    /// Insert booking maintaining sort order by start hour.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.hours.start, |b| b.hours.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    pub fn bookings_on(&self, date: &NaiveDate) -> &[Booking] {
        self.days.get(date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bookings on `date` whose range overlaps `range`.
    /// Binary search skips bookings starting at or after `range.end`.
    pub fn overlapping(&self, date: &NaiveDate, range: &HourRange) -> impl Iterator<Item = &Booking> {
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.hours.start < range.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.hours.end > range.start)
    }

    pub fn booking_mut(&mut self, date: &NaiveDate, id: BookingId) -> Option<&mut Booking> {
        self.days
            .get_mut(date)
            .and_then(|day| day.iter_mut().find(|b| b.id == id))
    }

    pub fn booking_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtCreated {
        id: CourtId,
        name: String,
    },
    CourtRenamed {
        id: CourtId,
        name: String,
    },
    CourtDeleted {
        id: CourtId,
    },
    BookingCreated {
        id: BookingId,
        court_id: CourtId,
        date: NaiveDate,
        hours: HourRange,
        people_count: i32,
        total_price: i64,
        token: Token,
        created_at: Ms,
    },
    BookingCheckedIn {
        id: BookingId,
        court_id: CourtId,
        date: NaiveDate,
        used_at: Ms,
    },
}

impl Event {
    pub fn booking_created(b: &Booking) -> Self {
        Event::BookingCreated {
            id: b.id,
            court_id: b.court_id,
            date: b.date,
            hours: b.hours,
            people_count: b.people_count,
            total_price: b.total_price,
            token: b.token,
            created_at: b.created_at,
        }
    }
}

// ── Boundary request types (unvalidated) ─────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityRequest {
    pub court_id: i64,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub court_id: i64,
    pub date: String,
    pub start_hour: i64,
    pub end_hour: i64,
    pub people_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub court_id: Option<i64>,
    pub pending_only: bool,
}

// ── Validated request types ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub court_id: CourtId,
    pub date: NaiveDate,
    pub hours: HourRange,
    pub people_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateWindow {
    Any,
    Exact(NaiveDate),
    /// Inclusive on both ends; an open end is unbounded.
    Range {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
}

impl DateWindow {
    pub fn contains(&self, date: &NaiveDate) -> bool {
        match self {
            DateWindow::Any => true,
            DateWindow::Exact(d) => d == date,
            DateWindow::Range { from, to } => {
                from.is_none_or(|f| f <= *date) && to.is_none_or(|t| *date <= t)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingQuery {
    pub window: DateWindow,
    pub court_id: Option<CourtId>,
    pub pending_only: bool,
}

impl BookingQuery {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.window.contains(&booking.date)
            && self.court_id.is_none_or(|c| c == booking.court_id)
            && (!self.pending_only || booking.used_at.is_none())
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub court_id: CourtId,
    pub date: NaiveDate,
    pub available: Vec<Hour>,
    pub booked: Vec<Hour>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking_id: BookingId,
    pub total_price: i64,
    pub token: Token,
}

/// A booking together with the name of its court.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub court_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckIn {
    pub checked_in: bool,
    pub already_used: bool,
    pub booking: BookingView,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingListing {
    pub count: usize,
    pub bookings: Vec<BookingView>,
}
