use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{BookingStore, CheckInTransition, StoreError};

pub type SharedCourtState = Arc<RwLock<CourtState>>;

/// Where the booking behind a token lives.
#[derive(Debug, Clone, Copy)]
struct TokenSlot {
    court_id: CourtId,
    date: NaiveDate,
    booking_id: BookingId,
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins its batch, and the batch shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// Apply a court-scoped event to its court. Caller holds the write lock.
fn apply_to_court(cs: &mut CourtState, event: &Event, tokens: &DashMap<Token, TokenSlot>) {
    match event {
        Event::CourtRenamed { name, .. } => {
            cs.court.name = name.clone();
        }
        Event::BookingCreated {
            id,
            court_id,
            date,
            hours,
            people_count,
            total_price,
            token,
            created_at,
        } => {
            cs.insert_booking(Booking {
                id: *id,
                court_id: *court_id,
                date: *date,
                hours: *hours,
                people_count: *people_count,
                total_price: *total_price,
                token: *token,
                created_at: *created_at,
                used_at: None,
            });
            tokens.insert(
                *token,
                TokenSlot {
                    court_id: *court_id,
                    date: *date,
                    booking_id: *id,
                },
            );
        }
        Event::BookingCheckedIn { id, date, used_at, .. } => {
            if let Some(booking) = cs.booking_mut(date, *id) {
                booking.used_at = Some(*used_at);
            }
        }
        // Created/Deleted change the court map itself, not a court's state.
        Event::CourtCreated { .. } | Event::CourtDeleted { .. } => {}
    }
}

fn event_court_id(event: &Event) -> CourtId {
    match event {
        Event::CourtCreated { id, .. }
        | Event::CourtRenamed { id, .. }
        | Event::CourtDeleted { id } => *id,
        Event::BookingCreated { court_id, .. } | Event::BookingCheckedIn { court_id, .. } => {
            *court_id
        }
    }
}

/// In-memory booking store made durable by a group-committed WAL.
///
/// One `RwLock` per court serialises every write that touches the court's
/// bookings. A mutation is appended to the WAL, and only applied to memory
/// once the append is acknowledged, while that write guard is held.
pub struct WalStore {
    courts: DashMap<CourtId, SharedCourtState>,
    tokens: DashMap<Token, TokenSlot>,
    /// Serialises court creation, deletion and compaction.
    catalog: Mutex<()>,
    /// Lowest id never handed out, deleted courts included. Past `CourtId::MAX`
    /// once the id space is exhausted.
    next_court_id: AtomicI64,
    next_booking_id: AtomicI64,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay `wal_path` and start the WAL writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tokens = DashMap::new();
        let mut courts: BTreeMap<CourtId, CourtState> = BTreeMap::new();
        let mut max_court: CourtId = 0;
        let mut max_booking: BookingId = 0;

        for event in &events {
            match event {
                Event::CourtCreated { id, name } => {
                    courts.insert(*id, CourtState::new(Court { id: *id, name: name.clone() }));
                    max_court = max_court.max(*id);
                }
                Event::CourtDeleted { id } => {
                    courts.remove(id);
                    max_court = max_court.max(*id);
                }
                other => {
                    if let Event::BookingCreated { id, .. } = other {
                        max_booking = max_booking.max(*id);
                    }
                    if let Some(cs) = courts.get_mut(&event_court_id(other)) {
                        apply_to_court(cs, other, &tokens);
                    }
                }
            }
        }

        let store = Self {
            courts: courts
                .into_iter()
                .map(|(id, cs)| (id, Arc::new(RwLock::new(cs))))
                .collect(),
            tokens,
            catalog: Mutex::new(()),
            next_court_id: AtomicI64::new(i64::from(max_court) + 1),
            next_booking_id: AtomicI64::new(max_booking + 1),
            wal_tx,
        };
        info!(
            events = events.len(),
            courts = store.courts.len(),
            bookings = store.tokens.len(),
            "store replayed"
        );
        Ok(store)
    }

    /// Send one event to the WAL writer and wait until it is on disk.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// WAL-append then apply. Caller holds the court's write guard.
    async fn persist_and_apply(&self, cs: &mut CourtState, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_court(cs, event, &self.tokens);
        Ok(())
    }

    /// Next unused id at or above the high-water mark. Caller holds the catalog lock.
    fn free_court_id(&self) -> Result<CourtId, StoreError> {
        let mut candidate = self.next_court_id.load(Ordering::SeqCst);
        loop {
            let id = CourtId::try_from(candidate).map_err(|_| StoreError::LimitExceeded("court ids exhausted"))?;
            if !self.courts.contains_key(&id) {
                return Ok(id);
            }
            candidate += 1;
        }
    }

    fn court_handle(&self, id: CourtId) -> Option<SharedCourtState> {
        self.courts.get(&id).map(|e| e.value().clone())
    }

    fn token_slot(&self, token: &Token) -> Option<TokenSlot> {
        self.tokens.get(token).map(|e| *e.value())
    }

    fn sorted_handles(&self) -> Vec<(CourtId, SharedCourtState)> {
        let mut handles: Vec<_> = self
            .courts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    /// Rewrite the WAL as the minimal event list that rebuilds the current state.
    ///
    /// Holds the catalog lock and a read guard on every court until the new
    /// file is in place, so no acknowledged write can fall between the
    /// snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _catalog = self.catalog.lock().await;
        let mut guards = Vec::new();
        for (_, handle) in self.sorted_handles() {
            guards.push(handle.read_owned().await);
        }

        let mut events = Vec::new();
        let mut max_live: CourtId = 0;
        for cs in guards.iter().filter(|cs| !cs.retired) {
            max_live = max_live.max(cs.court.id);
            events.push(Event::CourtCreated {
                id: cs.court.id,
                name: cs.court.name.clone(),
            });
            for booking in cs.bookings() {
                events.push(Event::booking_created(booking));
                if let Some(used_at) = booking.used_at {
                    events.push(Event::BookingCheckedIn {
                        id: booking.id,
                        court_id: booking.court_id,
                        date: booking.date,
                        used_at,
                    });
                }
            }
        }
        // Tombstone keeps deleted ids from being reissued after replay.
        let high_water = self.next_court_id.load(Ordering::SeqCst) - 1;
        if high_water > i64::from(max_live) {
            if let Ok(id) = CourtId::try_from(high_water) {
                events.push(Event::CourtDeleted { id });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn create_court(&self, id: Option<CourtId>, name: String) -> Result<Court, StoreError> {
        let _catalog = self.catalog.lock().await;
        if self.courts.len() >= MAX_COURTS {
            return Err(StoreError::LimitExceeded("too many courts"));
        }
        let id = match id {
            Some(id) => {
                if self.courts.contains_key(&id) {
                    return Err(StoreError::CourtExists(id));
                }
                id
            }
            None => self.free_court_id()?,
        };

        let event = Event::CourtCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.next_court_id.fetch_max(i64::from(id) + 1, Ordering::SeqCst);
        let court = Court { id, name };
        self.courts
            .insert(id, Arc::new(RwLock::new(CourtState::new(court.clone()))));
        Ok(court)
    }

    async fn rename_court(&self, id: CourtId, name: String) -> Result<Court, StoreError> {
        let handle = self.court_handle(id).ok_or(StoreError::CourtNotFound(id))?;
        let mut guard = handle.write().await;
        if guard.retired {
            return Err(StoreError::CourtNotFound(id));
        }
        let event = Event::CourtRenamed { id, name };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.court.clone())
    }

    async fn delete_court(&self, id: CourtId) -> Result<Court, StoreError> {
        let _catalog = self.catalog.lock().await;
        let handle = self.court_handle(id).ok_or(StoreError::CourtNotFound(id))?;
        let mut guard = handle.write().await;
        if guard.retired {
            return Err(StoreError::CourtNotFound(id));
        }
        let bookings = guard.booking_count();
        if bookings > 0 {
            return Err(StoreError::CourtInUse { court_id: id, bookings });
        }

        self.wal_append(&Event::CourtDeleted { id }).await?;
        guard.retired = true;
        self.courts.remove(&id);
        Ok(guard.court.clone())
    }

    async fn court(&self, id: CourtId) -> Result<Option<Court>, StoreError> {
        let Some(handle) = self.court_handle(id) else {
            return Ok(None);
        };
        let guard = handle.read().await;
        Ok((!guard.retired).then(|| guard.court.clone()))
    }

    async fn courts(&self) -> Result<Vec<Court>, StoreError> {
        let mut courts = Vec::new();
        for (_, handle) in self.sorted_handles() {
            let guard = handle.read().await;
            if !guard.retired {
                courts.push(guard.court.clone());
            }
        }
        Ok(courts)
    }

    async fn bookings_on(&self, court_id: CourtId, date: NaiveDate) -> Result<Vec<Booking>, StoreError> {
        let Some(handle) = self.court_handle(court_id) else {
            return Ok(Vec::new());
        };
        let guard = handle.read().await;
        Ok(guard.bookings_on(&date).to_vec())
    }

    async fn insert_booking_if_free(&self, draft: BookingDraft) -> Result<Booking, StoreError> {
        let court_id = draft.court_id;
        let handle = self
            .court_handle(court_id)
            .ok_or(StoreError::CourtNotFound(court_id))?;
        let mut guard = handle.write().await;
        if guard.retired {
            return Err(StoreError::CourtNotFound(court_id));
        }
        if let Some(existing) = guard.overlapping(&draft.date, &draft.hours).next() {
            return Err(StoreError::Overlap(existing.id));
        }

        let booking = draft.into_booking(self.next_booking_id.fetch_add(1, Ordering::SeqCst));
        self.persist_and_apply(&mut guard, &Event::booking_created(&booking))
            .await?;
        Ok(booking)
    }

    async fn booking_by_token(&self, token: &Token) -> Result<Option<Booking>, StoreError> {
        let Some(slot) = self.token_slot(token) else {
            return Ok(None);
        };
        let handle = self
            .court_handle(slot.court_id)
            .ok_or_else(|| StoreError::Corrupt(format!("token {token} points at missing court {}", slot.court_id)))?;
        let guard = handle.read().await;
        Ok(guard
            .bookings_on(&slot.date)
            .iter()
            .find(|b| b.id == slot.booking_id)
            .cloned())
    }

    async fn mark_used_if_pending(&self, token: &Token, now: Ms) -> Result<CheckInTransition, StoreError> {
        let Some(slot) = self.token_slot(token) else {
            return Ok(CheckInTransition::UnknownToken);
        };
        let handle = self
            .court_handle(slot.court_id)
            .ok_or_else(|| StoreError::Corrupt(format!("token {token} points at missing court {}", slot.court_id)))?;
        let mut guard = handle.write().await;
        let mut booking = guard
            .booking_mut(&slot.date, slot.booking_id)
            .map(|b| b.clone())
            .ok_or_else(|| StoreError::Corrupt(format!("token {token} points at missing booking {}", slot.booking_id)))?;
        if booking.used_at.is_some() {
            return Ok(CheckInTransition::AlreadyUsed(booking));
        }

        let event = Event::BookingCheckedIn {
            id: booking.id,
            court_id: booking.court_id,
            date: booking.date,
            used_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        booking.used_at = Some(now);
        Ok(CheckInTransition::Applied(booking))
    }

    async fn scan_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>, StoreError> {
        let handles: Vec<SharedCourtState> = match query.court_id {
            Some(id) => self.court_handle(id).into_iter().collect(),
            None => self.sorted_handles().into_iter().map(|(_, h)| h).collect(),
        };
        let mut found = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if guard.retired {
                continue;
            }
            found.extend(guard.bookings().filter(|b| query.matches(b)).cloned());
        }
        Ok(found)
    }
}
