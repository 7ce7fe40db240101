use std::collections::HashMap;

use crate::model::*;

use super::{Engine, EngineError, compute_availability, validate};

impl Engine {
    /// Free and booked slots for one court-day. Unknown courts are `CourtNotFound`.
    pub async fn availability(&self, req: &AvailabilityRequest) -> Result<Availability, EngineError> {
        let (court_id, date) = validate::availability_request(req)?;
        if self.store.court(court_id).await?.is_none() {
            return Err(EngineError::CourtNotFound(court_id));
        }
        let bookings = self.store.bookings_on(court_id, date).await?;
        let (available, booked) = compute_availability(&bookings);
        Ok(Availability {
            court_id,
            date,
            available,
            booked,
        })
    }

    pub async fn find_by_token(&self, token: &str) -> Result<BookingView, EngineError> {
        let token = validate::token(token)?;
        let booking = self
            .store
            .booking_by_token(&token)
            .await?
            .ok_or(EngineError::TokenNotFound(token))?;
        self.view(booking).await
    }

    /// Filtered bookings, ordered by date descending, then court, then start hour.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<BookingListing, EngineError> {
        let query = validate::booking_filter(filter)?;
        let mut bookings = self.store.scan_bookings(&query).await?;
        bookings.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(a.court_id.cmp(&b.court_id))
                .then(a.hours.start.cmp(&b.hours.start))
        });

        let names: HashMap<CourtId, String> = self
            .store
            .courts()
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();
        let bookings = bookings
            .into_iter()
            .map(|booking| {
                let court_name = names
                    .get(&booking.court_id)
                    .cloned()
                    .ok_or_else(|| dangling(&booking))?;
                Ok(BookingView { booking, court_name })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(BookingListing {
            count: bookings.len(),
            bookings,
        })
    }

    pub async fn list_courts(&self) -> Result<Vec<Court>, EngineError> {
        Ok(self.store.courts().await?)
    }

    pub async fn get_court(&self, id: i64) -> Result<Court, EngineError> {
        let id = validate::court_id(id)?;
        self.store.court(id).await?.ok_or(EngineError::CourtNotFound(id))
    }

    /// Attach the court name to a booking.
    pub(super) async fn view(&self, booking: Booking) -> Result<BookingView, EngineError> {
        let court = self
            .store
            .court(booking.court_id)
            .await?
            .ok_or_else(|| dangling(&booking))?;
        Ok(BookingView {
            booking,
            court_name: court.name,
        })
    }
}

/// Courts with bookings cannot be deleted, so this means the store is inconsistent.
fn dangling(booking: &Booking) -> EngineError {
    EngineError::Storage(format!(
        "booking {} references missing court {}",
        booking.id, booking.court_id
    ))
}
