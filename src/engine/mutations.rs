use tracing::info;

use crate::model::*;
use crate::observability;
use crate::store::CheckInTransition;

use super::{Engine, EngineError, now_ms, validate};

impl Engine {
    /// Create a court. `id = None` lets the store pick the next id.
    pub async fn create_court(&self, id: Option<i64>, name: &str) -> Result<Court, EngineError> {
        let id = id.map(validate::court_id).transpose()?;
        let name = validate::court_name(name)?;
        let court = self.store.create_court(id, name).await?;
        info!(court_id = court.id, name = %court.name, "court created");
        Ok(court)
    }

    pub async fn rename_court(&self, id: i64, name: &str) -> Result<Court, EngineError> {
        let id = validate::court_id(id)?;
        let name = validate::court_name(name)?;
        Ok(self.store.rename_court(id, name).await?)
    }

    /// Fails with `CourtInUse` while any booking references the court.
    pub async fn delete_court(&self, id: i64) -> Result<Court, EngineError> {
        let id = validate::court_id(id)?;
        let court = self.store.delete_court(id).await?;
        info!(court_id = id, "court deleted");
        Ok(court)
    }

    pub async fn create_booking(&self, req: &BookingRequest) -> Result<BookingReceipt, EngineError> {
        let new = validate::booking_request(req, &self.policy)?;
        let draft = BookingDraft {
            court_id: new.court_id,
            date: new.date,
            hours: new.hours,
            people_count: new.people_count,
            total_price: i64::from(new.hours.hours()) * PRICE_PER_HOUR * i64::from(new.people_count),
            token: Token::generate(),
            created_at: now_ms(),
        };

        let booking = match self.store.insert_booking_if_free(draft).await {
            Ok(b) => b,
            Err(e) => {
                let e = EngineError::from(e);
                if matches!(e, EngineError::Conflict(_)) {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking_id = booking.id,
            court_id = booking.court_id,
            date = %booking.date,
            start = booking.hours.start,
            end = booking.hours.end,
            "booking created"
        );
        Ok(BookingReceipt {
            booking_id: booking.id,
            total_price: booking.total_price,
            token: booking.token,
        })
    }

    /// Redeem a token. Exactly one caller sees `checked_in = true`; every
    /// later call reports `already_used` with the same `used_at`.
    pub async fn check_in(&self, token: &str) -> Result<CheckIn, EngineError> {
        let token = validate::token(token)?;
        let (checked_in, booking) = match self.store.mark_used_if_pending(&token, now_ms()).await? {
            CheckInTransition::Applied(b) => (true, b),
            CheckInTransition::AlreadyUsed(b) => (false, b),
            CheckInTransition::UnknownToken => {
                metrics::counter!(observability::CHECK_INS_TOTAL, "outcome" => "not_found").increment(1);
                return Err(EngineError::TokenNotFound(token));
            }
        };
        let outcome = if checked_in { "checked_in" } else { "already_used" };
        metrics::counter!(observability::CHECK_INS_TOTAL, "outcome" => outcome).increment(1);
        info!(booking_id = booking.id, outcome, "check-in");

        Ok(CheckIn {
            checked_in,
            already_used: !checked_in,
            booking: self.view(booking).await?,
        })
    }
}
