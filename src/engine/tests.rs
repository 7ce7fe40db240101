use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::*;
use crate::model::*;
use crate::store::{BookingStore, CheckInTransition, StoreError, WalStore};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courtd_test_engine_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Engine over a fresh WAL with courts 1 and 2.
async fn engine_with_courts(name: &str) -> Engine {
    let store = Arc::new(WalStore::open(&test_wal_path(name)).unwrap());
    let engine = Engine::new(store, BookingPolicy::default());
    engine.create_court(None, "Court 1").await.unwrap();
    engine.create_court(None, "Court 2").await.unwrap();
    engine
}

fn req(court_id: i64, date: &str, start: i64, end: i64, people: i64) -> BookingRequest {
    BookingRequest {
        court_id,
        date: date.into(),
        start_hour: start,
        end_hour: end,
        people_count: people,
    }
}

fn avail(court_id: i64, date: &str) -> AvailabilityRequest {
    AvailabilityRequest {
        court_id,
        date: date.into(),
    }
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn empty_day_is_fully_available() {
    let engine = engine_with_courts("empty_day.wal").await;
    for date in ["2025-06-01", "2030-12-31"] {
        for court in [1, 2] {
            let a = engine.availability(&avail(court, date)).await.unwrap();
            assert_eq!(a.available, (7..=21).collect::<Vec<_>>());
            assert!(a.booked.is_empty());
        }
    }
}

#[tokio::test]
async fn availability_reflects_bookings_and_partitions_the_day() {
    let engine = engine_with_courts("availability_partition.wal").await;
    engine.create_booking(&req(1, "2025-06-01", 7, 9, 1)).await.unwrap();
    engine.create_booking(&req(1, "2025-06-01", 13, 14, 2)).await.unwrap();
    engine.create_booking(&req(1, "2025-06-01", 20, 24, 2)).await.unwrap();
    engine.create_booking(&req(2, "2025-06-01", 10, 11, 2)).await.unwrap();

    let a = engine.availability(&avail(1, "2025-06-01")).await.unwrap();
    assert_eq!(a.booked, vec![7, 8, 13, 20, 21]);
    assert!(a.available.iter().all(|h| !a.booked.contains(h)));
    let mut union: Vec<Hour> = a.available.iter().chain(&a.booked).copied().collect();
    union.sort_unstable();
    assert_eq!(union, SLOT_HOURS.collect::<Vec<_>>());

    let other_day = engine.availability(&avail(1, "2025-06-02")).await.unwrap();
    assert!(other_day.booked.is_empty());
}

#[tokio::test]
async fn availability_unknown_court_is_not_found() {
    let engine = engine_with_courts("availability_unknown.wal").await;
    let err = engine.availability(&avail(99, "2025-06-01")).await.unwrap_err();
    assert!(matches!(err, EngineError::CourtNotFound(99)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn availability_rejects_bad_input() {
    let engine = engine_with_courts("availability_bad_input.wal").await;
    let err = engine.availability(&avail(0, "2025-06-01")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = engine.availability(&avail(1, "June 1st")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ── Booking creation ─────────────────────────────────────

#[tokio::test]
async fn end_before_start_is_validation_error() {
    let engine = engine_with_courts("end_before_start.wal").await;
    let err = engine.create_booking(&req(1, "2025-06-01", 10, 9, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("end must exceed start"));
}

#[tokio::test]
async fn overlap_conflicts_and_touching_succeeds() {
    let engine = engine_with_courts("overlap.wal").await;
    engine.create_booking(&req(1, "2025-06-01", 10, 12, 1)).await.unwrap();

    let err = engine.create_booking(&req(1, "2025-06-01", 11, 13, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("slot already booked"));

    engine.create_booking(&req(1, "2025-06-01", 12, 14, 1)).await.unwrap();
    // Same hours on another court or day do not conflict.
    engine.create_booking(&req(2, "2025-06-01", 10, 12, 1)).await.unwrap();
    engine.create_booking(&req(1, "2025-06-02", 10, 12, 1)).await.unwrap();
}

#[tokio::test]
async fn enclosing_and_enclosed_ranges_conflict() {
    let engine = engine_with_courts("enclosing.wal").await;
    engine.create_booking(&req(1, "2025-06-01", 10, 14, 1)).await.unwrap();
    for (s, e) in [(11, 12), (9, 15), (10, 14), (13, 16), (8, 11)] {
        let err = engine.create_booking(&req(1, "2025-06-01", s, e, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "[{s}, {e})");
    }
}

#[tokio::test]
async fn stored_bookings_never_overlap() {
    let engine = engine_with_courts("never_overlap.wal").await;
    let attempts = [
        (7, 9), (8, 10), (9, 10), (9, 12), (11, 12), (12, 13), (10, 11),
        (14, 18), (16, 17), (18, 22), (21, 23), (13, 14), (7, 8),
    ];
    for (s, e) in attempts {
        let _ = engine.create_booking(&req(1, "2025-06-01", s, e, 1)).await;
    }

    let listing = engine
        .list_bookings(&BookingFilter {
            date: Some("2025-06-01".into()),
            court_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    let ranges: Vec<HourRange> = listing.bookings.iter().map(|v| v.booking.hours).collect();
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
    assert_eq!(listing.count, 8);
}

#[tokio::test]
async fn price_is_hours_times_rate_times_people() {
    let engine = engine_with_courts("price.wal").await;
    let receipt = engine.create_booking(&req(1, "2025-06-01", 7, 9, 3)).await.unwrap();
    assert_eq!(receipt.total_price, 120);

    let receipt = engine.create_booking(&req(1, "2025-06-01", 9, 10, 1)).await.unwrap();
    assert_eq!(receipt.total_price, PRICE_PER_HOUR);
}

#[tokio::test]
async fn receipt_token_is_canonical_and_unique() {
    let engine = engine_with_courts("receipt_token.wal").await;
    let a = engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap();
    let b = engine.create_booking(&req(1, "2025-06-01", 9, 10, 1)).await.unwrap();
    assert_ne!(a.token, b.token);
    assert_ne!(a.booking_id, b.booking_id);
    assert_eq!(Token::parse(&a.token.to_string()), Some(a.token));
}

#[tokio::test]
async fn booking_unknown_court_is_not_found() {
    let engine = engine_with_courts("booking_unknown_court.wal").await;
    let err = engine.create_booking(&req(42, "2025-06-01", 8, 9, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::CourtNotFound(42)));
}

#[tokio::test]
async fn opening_hours_policy() {
    let store = Arc::new(WalStore::open(&test_wal_path("opening_hours.wal")).unwrap());
    let engine = Engine::new(store, BookingPolicy { enforce_opening_hours: true });
    engine.create_court(None, "Court 1").await.unwrap();

    let err = engine.create_booking(&req(1, "2025-06-01", 21, 23, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    engine.create_booking(&req(1, "2025-06-01", 20, 22, 1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_for_same_slot_have_one_winner() {
    let engine = Arc::new(engine_with_courts("concurrent_creates.wal").await);
    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        // Every request covers 12:00.
        let (s, e) = (10 + i % 3, 13);
        handles.push(tokio::spawn(async move {
            engine.create_booking(&req(1, "2025-06-01", s, e, 1)).await
        }));
    }
    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(won, 1);
}

// ── Token lookup and check-in ────────────────────────────

#[tokio::test]
async fn find_by_token_returns_booking_with_court_name() {
    let engine = engine_with_courts("find_by_token.wal").await;
    let receipt = engine.create_booking(&req(2, "2025-06-01", 8, 10, 4)).await.unwrap();

    let view = engine.find_by_token(&receipt.token.to_string()).await.unwrap();
    assert_eq!(view.booking.id, receipt.booking_id);
    assert_eq!(view.booking.court_id, 2);
    assert_eq!(view.booking.people_count, 4);
    assert_eq!(view.booking.state(), BookingState::Pending);
    assert_eq!(view.court_name, "Court 2");
}

#[tokio::test]
async fn find_by_token_unknown_and_malformed() {
    let engine = engine_with_courts("find_by_token_unknown.wal").await;
    let unknown = Token::generate().to_string();
    let err = engine.find_by_token(&unknown).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let receipt = engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap();
    let upper = receipt.token.to_string().to_uppercase();
    let err = engine.find_by_token(&upper).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn check_in_twice_reports_already_used_with_same_timestamp() {
    let engine = engine_with_courts("check_in_twice.wal").await;
    let receipt = engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap();
    let token = receipt.token.to_string();

    let first = engine.check_in(&token).await.unwrap();
    assert!(first.checked_in);
    assert!(!first.already_used);
    assert_eq!(first.booking.booking.state(), BookingState::Used);
    let used_at = first.booking.booking.used_at;
    assert!(used_at.is_some());

    for _ in 0..3 {
        let again = engine.check_in(&token).await.unwrap();
        assert!(!again.checked_in);
        assert!(again.already_used);
        assert_eq!(again.booking.booking.used_at, used_at);
    }

    let view = engine.find_by_token(&token).await.unwrap();
    assert_eq!(view.booking.used_at, used_at);
}

#[tokio::test]
async fn check_in_unknown_token_is_not_found() {
    let engine = engine_with_courts("check_in_unknown.wal").await;
    let err = engine.check_in(&Token::generate().to_string()).await.unwrap_err();
    assert!(matches!(err, EngineError::TokenNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Not a token at all: rejected before any lookup.
    let err = engine.check_in("nonexistent-token").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_check_ins_have_one_winner() {
    let engine = Arc::new(engine_with_courts("concurrent_check_ins.wal").await);
    let receipt = engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap();
    let token = receipt.token.to_string();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move { engine.check_in(&token).await }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap().unwrap());
    }
    assert_eq!(results.iter().filter(|r| r.checked_in).count(), 1);
    assert_eq!(results.iter().filter(|r| r.already_used).count(), 19);
    let used_at = results[0].booking.booking.used_at;
    assert!(results.iter().all(|r| r.booking.booking.used_at == used_at));
}

// ── Listing ──────────────────────────────────────────────

#[tokio::test]
async fn listing_range_is_inclusive_and_ordered() {
    let engine = engine_with_courts("listing_range.wal").await;
    for (court, date, s, e) in [
        (1, "2025-05-31", 8, 9),
        (2, "2025-06-01", 14, 15),
        (1, "2025-06-01", 10, 11),
        (1, "2025-06-01", 8, 9),
        (2, "2025-06-15", 9, 10),
        (1, "2025-06-30", 20, 21),
        (1, "2025-07-01", 8, 9),
    ] {
        engine.create_booking(&req(court, date, s, e, 1)).await.unwrap();
    }

    let listing = engine
        .list_bookings(&BookingFilter {
            from: Some("2025-06-01".into()),
            to: Some("2025-06-30".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let got: Vec<(NaiveDate, CourtId, Hour)> = listing
        .bookings
        .iter()
        .map(|v| (v.booking.date, v.booking.court_id, v.booking.hours.start))
        .collect();
    assert_eq!(
        got,
        vec![
            (d("2025-06-30"), 1, 20),
            (d("2025-06-15"), 2, 9),
            (d("2025-06-01"), 1, 8),
            (d("2025-06-01"), 1, 10),
            (d("2025-06-01"), 2, 14),
        ]
    );
    assert_eq!(listing.count, 5);
    assert_eq!(listing.bookings[4].court_name, "Court 2");
}

#[tokio::test]
async fn listing_filters_date_court_and_pending() {
    let engine = engine_with_courts("listing_filters.wal").await;
    let used = engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap();
    engine.create_booking(&req(1, "2025-06-01", 9, 10, 1)).await.unwrap();
    engine.create_booking(&req(2, "2025-06-01", 9, 10, 1)).await.unwrap();
    engine.create_booking(&req(1, "2025-06-02", 9, 10, 1)).await.unwrap();
    engine.check_in(&used.token.to_string()).await.unwrap();

    let exact = engine
        .list_bookings(&BookingFilter { date: Some("2025-06-01".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(exact.count, 3);

    let court_two = engine
        .list_bookings(&BookingFilter { court_id: Some(2), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(court_two.count, 1);

    let pending = engine
        .list_bookings(&BookingFilter {
            date: Some("2025-06-01".into()),
            court_id: Some(1),
            pending_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.count, 1);
    assert_eq!(pending.bookings[0].booking.hours.start, 9);

    let all = engine.list_bookings(&BookingFilter::default()).await.unwrap();
    assert_eq!(all.count, 4);
    assert_eq!(all.bookings[0].booking.date, d("2025-06-02"));
}

#[tokio::test]
async fn listing_from_after_to_is_validation_error() {
    let engine = engine_with_courts("listing_bad_range.wal").await;
    let err = engine
        .list_bookings(&BookingFilter {
            from: Some("2025-06-30".into()),
            to: Some("2025-06-01".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ── Courts ───────────────────────────────────────────────

#[tokio::test]
async fn court_administration() {
    let engine = engine_with_courts("court_admin.wal").await;
    let courts = engine.list_courts().await.unwrap();
    assert_eq!(courts.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);

    let renamed = engine.rename_court(2, "  Center Court ").await.unwrap();
    assert_eq!(renamed.name, "Center Court");
    assert_eq!(engine.get_court(2).await.unwrap().name, "Center Court");

    let err = engine.create_court(Some(1), "dup").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(1)));
    let err = engine.create_court(None, "   ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = engine.rename_court(9, "x").await.unwrap_err();
    assert!(matches!(err, EngineError::CourtNotFound(9)));

    engine.delete_court(2).await.unwrap();
    assert!(matches!(engine.get_court(2).await, Err(EngineError::CourtNotFound(2))));
    assert!(matches!(engine.delete_court(2).await, Err(EngineError::CourtNotFound(2))));
}

#[tokio::test]
async fn deleting_court_with_bookings_is_rejected() {
    let engine = engine_with_courts("delete_in_use.wal").await;
    engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap();
    let err = engine.delete_court(1).await.unwrap_err();
    assert!(matches!(err, EngineError::CourtInUse { court_id: 1, bookings: 1 }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(engine.get_court(1).await.is_ok());
}

// ── Storage failures ─────────────────────────────────────

/// Store whose every call fails, to check that storage errors surface as
/// internal failures rather than as one of the domain kinds.
struct BrokenStore;

fn broken() -> StoreError {
    StoreError::Wal("disk unavailable".into())
}

#[async_trait]
impl BookingStore for BrokenStore {
    async fn create_court(&self, _: Option<CourtId>, _: String) -> Result<Court, StoreError> {
        Err(broken())
    }
    async fn rename_court(&self, _: CourtId, _: String) -> Result<Court, StoreError> {
        Err(broken())
    }
    async fn delete_court(&self, _: CourtId) -> Result<Court, StoreError> {
        Err(broken())
    }
    async fn court(&self, _: CourtId) -> Result<Option<Court>, StoreError> {
        Err(broken())
    }
    async fn courts(&self) -> Result<Vec<Court>, StoreError> {
        Err(broken())
    }
    async fn bookings_on(&self, _: CourtId, _: NaiveDate) -> Result<Vec<Booking>, StoreError> {
        Err(broken())
    }
    async fn insert_booking_if_free(&self, _: BookingDraft) -> Result<Booking, StoreError> {
        Err(broken())
    }
    async fn booking_by_token(&self, _: &Token) -> Result<Option<Booking>, StoreError> {
        Err(broken())
    }
    async fn mark_used_if_pending(&self, _: &Token, _: Ms) -> Result<CheckInTransition, StoreError> {
        Err(broken())
    }
    async fn scan_bookings(&self, _: &BookingQuery) -> Result<Vec<Booking>, StoreError> {
        Err(broken())
    }
}

#[tokio::test]
async fn storage_failures_are_internal() {
    let engine = Engine::new(Arc::new(BrokenStore), BookingPolicy::default());
    let token = Token::generate().to_string();

    let errors = vec![
        engine.create_booking(&req(1, "2025-06-01", 8, 9, 1)).await.unwrap_err(),
        engine.check_in(&token).await.unwrap_err(),
        engine.find_by_token(&token).await.unwrap_err(),
        engine.availability(&avail(1, "2025-06-01")).await.unwrap_err(),
        engine.list_bookings(&BookingFilter::default()).await.unwrap_err(),
        engine.create_court(None, "x").await.unwrap_err(),
    ];
    for err in errors {
        assert_eq!(err.kind(), ErrorKind::Internal, "{err}");
        assert!(err.to_string().contains("disk unavailable"));
    }

    // Validation still runs first.
    let err = engine.create_booking(&req(1, "2025-06-01", 9, 8, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
