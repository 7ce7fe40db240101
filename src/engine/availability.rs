use std::ops::RangeInclusive;

use crate::model::*;

/// Slot start hours reported by availability: 07:00 through 21:00.
pub const SLOT_HOURS: RangeInclusive<Hour> = OPENING_HOUR..=CLOSING_HOUR - 1;

// ── Availability Algorithm ────────────────────────────────────────

/// Partition `SLOT_HOURS` into `(available, booked)`, both ascending.
///
/// An hour is booked if any booking covers it. Parts of a booking that fall
/// outside the slot window are ignored, and overlapping bookings coalesce.
pub fn compute_availability<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> (Vec<Hour>, Vec<Hour>) {
    let first = *SLOT_HOURS.start();
    let mut occupied = [false; (CLOSING_HOUR - OPENING_HOUR) as usize];

    for booking in bookings {
        let from = booking.hours.start.max(first);
        let to = booking.hours.end.min(*SLOT_HOURS.end() + 1);
        for h in from..to {
            occupied[(h - first) as usize] = true;
        }
    }

    SLOT_HOURS.partition(|h| !occupied[(h - first) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn booking(start: Hour, end: Hour) -> Booking {
        Booking {
            id: 1,
            court_id: 1,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            hours: HourRange::new(start, end),
            people_count: 1,
            total_price: 0,
            token: Token::generate(),
            created_at: 0,
            used_at: None,
        }
    }

    fn all_hours() -> Vec<Hour> {
        SLOT_HOURS.collect()
    }

    #[test]
    fn no_bookings_all_available() {
        let (available, booked) = compute_availability(&[]);
        assert_eq!(available, (7..=21).collect::<Vec<_>>());
        assert!(booked.is_empty());
    }

    #[test]
    fn single_booking_marks_half_open_range() {
        let (available, booked) = compute_availability(&[booking(10, 12)]);
        assert_eq!(booked, vec![10, 11]);
        assert!(available.contains(&9));
        assert!(available.contains(&12));
        assert_eq!(available.len(), 13);
    }

    #[test]
    fn overlapping_bookings_coalesce() {
        let (_, booked) = compute_availability(&[booking(8, 11), booking(9, 10), booking(10, 12)]);
        assert_eq!(booked, vec![8, 9, 10, 11]);
    }

    #[test]
    fn out_of_window_parts_are_clipped() {
        let (available, booked) = compute_availability(&[booking(20, 24), booking(0, 8)]);
        assert_eq!(booked, vec![7, 20, 21]);
        assert_eq!(available, (8..=19).collect::<Vec<_>>());

        let (available, booked) = compute_availability(&[booking(22, 24), booking(2, 7)]);
        assert!(booked.is_empty());
        assert_eq!(available, all_hours());
    }

    #[test]
    fn full_day() {
        let (available, booked) = compute_availability(&[booking(7, 22)]);
        assert!(available.is_empty());
        assert_eq!(booked, all_hours());
    }

    #[test]
    fn partition_is_disjoint_and_complete() {
        let sets = [
            vec![],
            vec![booking(7, 8)],
            vec![booking(9, 11), booking(15, 18)],
            vec![booking(0, 24)],
            vec![booking(11, 13), booking(12, 14), booking(21, 23)],
        ];
        for bookings in &sets {
            let (available, booked) = compute_availability(bookings);
            assert!(available.iter().all(|h| !booked.contains(h)));
            let mut union: Vec<Hour> = available.iter().chain(booked.iter()).copied().collect();
            union.sort_unstable();
            assert_eq!(union, all_hours());
            assert!(available.windows(2).all(|w| w[0] < w[1]));
            assert!(booked.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
