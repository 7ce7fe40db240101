//! Hard caps on stored state and query size.

pub const MAX_COURTS: usize = 1_000;
pub const MAX_COURT_NAME_LEN: usize = 120;
pub const MAX_PEOPLE_PER_BOOKING: i64 = 100;
/// Widest inclusive `[from, to]` listing window, in days.
pub const MAX_LISTING_WINDOW_DAYS: i64 = 366 * 5;
