//! Boundary validation: one function per operation, turning raw request
//! values into typed requests or an `EngineError::Validation` naming the field.

use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::{BookingPolicy, EngineError};

pub fn court_id(raw: i64) -> Result<CourtId, EngineError> {
    if raw < 1 {
        return Err(EngineError::validation("court_id", "must be a positive integer"));
    }
    CourtId::try_from(raw).map_err(|_| EngineError::validation("court_id", "out of range"))
}

/// Strict `YYYY-MM-DD`.
pub fn date(field: &'static str, raw: &str) -> Result<NaiveDate, EngineError> {
    let shaped = raw.len() == 10
        && raw.char_indices().all(|(i, c)| match i {
            4 | 7 => c == '-',
            _ => c.is_ascii_digit(),
        });
    if !shaped {
        return Err(EngineError::validation(field, format!("expected YYYY-MM-DD, got {raw:?}")));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| EngineError::validation(field, format!("no such calendar date: {raw}")))
}

pub fn token(raw: &str) -> Result<Token, EngineError> {
    Token::parse(raw).ok_or_else(|| EngineError::validation("token", "expected a lowercase hyphenated UUID"))
}

/// Trimmed, non-empty, bounded.
pub fn court_name(raw: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EngineError::validation("name", "must not be empty"));
    }
    if name.chars().count() > MAX_COURT_NAME_LEN {
        return Err(EngineError::validation(
            "name",
            format!("longer than {MAX_COURT_NAME_LEN} characters"),
        ));
    }
    Ok(name.to_string())
}

pub fn availability_request(req: &AvailabilityRequest) -> Result<(CourtId, NaiveDate), EngineError> {
    Ok((court_id(req.court_id)?, date("date", &req.date)?))
}

pub fn booking_request(req: &BookingRequest, policy: &BookingPolicy) -> Result<NewBooking, EngineError> {
    if req.end_hour <= req.start_hour {
        return Err(EngineError::validation("end_hour", "end must exceed start"));
    }
    let court_id = court_id(req.court_id)?;
    let date = date("date", &req.date)?;

    if !(0..=23).contains(&req.start_hour) {
        return Err(EngineError::validation("start_hour", "must be between 0 and 23"));
    }
    if !(1..=24).contains(&req.end_hour) {
        return Err(EngineError::validation("end_hour", "must be between 1 and 24"));
    }
    // Both fit in an Hour after the range checks.
    let (start, end) = (req.start_hour as Hour, req.end_hour as Hour);
    if policy.enforce_opening_hours {
        if start < OPENING_HOUR {
            return Err(EngineError::validation(
                "start_hour",
                format!("courts open at {OPENING_HOUR}:00"),
            ));
        }
        if end > CLOSING_HOUR {
            return Err(EngineError::validation(
                "end_hour",
                format!("courts close at {CLOSING_HOUR}:00"),
            ));
        }
    }

    if req.people_count < 1 {
        return Err(EngineError::validation("people_count", "must be at least 1"));
    }
    if req.people_count > MAX_PEOPLE_PER_BOOKING {
        return Err(EngineError::validation(
            "people_count",
            format!("at most {MAX_PEOPLE_PER_BOOKING} people per booking"),
        ));
    }

    Ok(NewBooking {
        court_id,
        date,
        hours: HourRange::new(start, end),
        people_count: req.people_count as i32,
    })
}

/// A range (`from`/`to`) takes priority over an exact `date`.
pub fn booking_filter(filter: &BookingFilter) -> Result<BookingQuery, EngineError> {
    let from = filter.from.as_deref().map(|s| date("from", s)).transpose()?;
    let to = filter.to.as_deref().map(|s| date("to", s)).transpose()?;

    let window = if from.is_some() || to.is_some() {
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(EngineError::validation("from", "from must not be after to"));
            }
            if (t - f).num_days() > MAX_LISTING_WINDOW_DAYS {
                return Err(EngineError::LimitExceeded("listing window too wide"));
            }
        }
        DateWindow::Range { from, to }
    } else if let Some(d) = filter.date.as_deref() {
        DateWindow::Exact(date("date", d)?)
    } else {
        DateWindow::Any
    };

    let court_id = filter.court_id.map(court_id).transpose()?;
    Ok(BookingQuery {
        window,
        court_id,
        pending_only: filter.pending_only,
    })
}
