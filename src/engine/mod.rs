mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod recurrence;
mod recurring;

pub use availability::is_area_available;
pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use recurrence::expand_dates;
pub use recurring::{RecurringBatch, SkippedDate};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

pub type SharedAreaState = Arc<RwLock<AreaState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Vec<Event>, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes don't
    // leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Vec<Event>, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Area locks ───────────────────────────────────────────

/// Write guards on a set of areas, held across validate-then-commit so no
/// other request can book those areas in between. Also holds a shared permit
/// on the commit gate, which compaction takes exclusively.
pub(super) struct AreaGuards {
    _gate: OwnedRwLockReadGuard<()>,
    /// Sorted by area id.
    guards: Vec<(Ulid, OwnedRwLockWriteGuard<AreaState>)>,
}

impl AreaGuards {
    pub(super) fn get(&self, id: &Ulid) -> Option<&AreaState> {
        self.guards
            .binary_search_by_key(id, |(gid, _)| *gid)
            .ok()
            .map(|i| &*self.guards[i].1)
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut AreaState> {
        match self.guards.binary_search_by_key(id, |(gid, _)| *gid) {
            Ok(i) => Some(&mut *self.guards[i].1),
            Err(_) => None,
        }
    }

    pub(super) fn holds_all(&self, ids: impl IntoIterator<Item = Ulid>) -> bool {
        ids.into_iter().all(|id| self.get(&id).is_some())
    }
}

/// An id reserved by an in-flight create. Released on drop, after the
/// create has committed or failed.
pub(super) struct IdClaim<'a> {
    claims: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

pub struct Engine {
    pub(super) areas: DashMap<Ulid, SharedAreaState>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) patterns: DashMap<Ulid, RecurringPattern>,
    /// Reverse lookup: availability id → area id
    pub(super) availability_to_area: DashMap<Ulid, Ulid>,
    /// Ids held by creates that have not committed yet.
    pub(super) claimed_ids: DashMap<Ulid, ()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Open the engine on the WAL at `wal_path` with the system clock.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::new(wal_path, Arc::new(SystemClock))
    }

    /// Replay the WAL and start its writer task. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let frames = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            areas: DashMap::new(),
            bookings: DashMap::new(),
            patterns: DashMap::new(),
            availability_to_area: DashMap::new(),
            claimed_ids: DashMap::new(),
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            clock,
        };

        // Nothing else holds these locks yet, so try_* always succeeds. Never
        // block here: this may run inside an async context.
        let mut replayed = 0usize;
        for event in frames.iter().flatten() {
            let Some(mut guards) = engine.try_lock_areas(engine.affected_areas(event)) else {
                warn!("replay: could not lock areas for {event:?}, skipping");
                continue;
            };
            engine.apply(event, &mut guards);
            replayed += 1;
        }
        tracing::info!(
            "replayed {replayed} events from {} commits ({} areas, {} bookings, {} patterns)",
            frames.len(),
            engine.areas.len(),
            engine.bookings.len(),
            engine.patterns.len()
        );

        Ok(engine)
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_area_state(&self, id: &Ulid) -> Option<SharedAreaState> {
        self.areas.get(id).map(|e| e.value().clone())
    }

    /// Take the commit gate, then write locks on `ids` in sorted order.
    pub(super) async fn lock_areas(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<AreaGuards, EngineError> {
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let gate = self.commit_gate.clone().read_owned().await;
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let rs = self.get_area_state(&id).ok_or(EngineError::NotFound(id))?;
            let guard = rs.clone().write_owned().await;
            // The area may have been deleted while we waited for its lock.
            let current = self
                .areas
                .get(&id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &rs));
            if !current {
                return Err(EngineError::NotFound(id));
            }
            guards.push((id, guard));
        }
        Ok(AreaGuards { _gate: gate, guards })
    }

    /// Claim a new entity id for the rest of a create. Fails if `exists`
    /// reports the id as stored or another create already holds it.
    pub(super) fn claim_id(
        &self,
        id: Ulid,
        exists: impl FnOnce(&Ulid) -> bool,
    ) -> Result<IdClaim<'_>, EngineError> {
        match self.claimed_ids.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let claim = IdClaim {
            claims: &self.claimed_ids,
            id,
        };
        if exists(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(claim)
    }

    /// Non-blocking variant for replay. Areas that don't exist are left out.
    fn try_lock_areas(&self, mut ids: Vec<Ulid>) -> Option<AreaGuards> {
        ids.sort();
        ids.dedup();
        let gate = self.commit_gate.clone().try_read_owned().ok()?;
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.get_area_state(&id) {
                guards.push((id, rs.try_write_owned().ok()?));
            }
        }
        Some(AreaGuards { _gate: gate, guards })
    }

    /// Areas whose state an event touches.
    fn affected_areas(&self, event: &Event) -> Vec<Ulid> {
        match event {
            Event::AreaCreated { .. } => Vec::new(),
            Event::AreaUpdated { area } => vec![area.id],
            Event::AreaDeleted { id } => vec![*id],
            Event::AvailabilityAdded { availability } => vec![availability.area_id],
            Event::AvailabilityUpdated { availability } => {
                let mut ids = vec![availability.area_id];
                if let Some(prev) = self.availability_to_area.get(&availability.id) {
                    ids.push(*prev.value());
                }
                ids
            }
            Event::AvailabilityRemoved { area_id, .. } => vec![*area_id],
            Event::BookingCreated { booking } => booking.area_ids().collect(),
            Event::BookingUpdated { booking } => {
                let mut ids: Vec<Ulid> = booking.area_ids().collect();
                if let Some(prev) = self.bookings.get(&booking.id) {
                    ids.extend(prev.area_ids());
                }
                ids
            }
            Event::BookingDeleted { id } => self
                .bookings
                .get(id)
                .map(|b| b.area_ids().collect())
                .unwrap_or_default(),
            Event::PatternCreated { .. } | Event::PatternUpdated { .. } | Event::PatternDeleted { .. } => {
                Vec::new()
            }
        }
    }

    /// Apply one event to in-memory state. Caller holds guards on every
    /// affected area.
    pub(super) fn apply(&self, event: &Event, guards: &mut AreaGuards) {
        match event {
            Event::AreaCreated { area } => {
                self.areas
                    .insert(area.id, Arc::new(RwLock::new(AreaState::new(area.clone()))));
            }
            Event::AreaUpdated { area } => {
                if let Some(rs) = guards.get_mut(&area.id) {
                    rs.area = area.clone();
                }
            }
            Event::AreaDeleted { id } => {
                if let Some(rs) = guards.get(id) {
                    for a in &rs.availabilities {
                        self.availability_to_area.remove(&a.id);
                    }
                }
                self.areas.remove(id);
            }
            Event::AvailabilityAdded { availability } => {
                if let Some(rs) = guards.get_mut(&availability.area_id) {
                    rs.upsert_availability(availability.clone());
                    self.availability_to_area
                        .insert(availability.id, availability.area_id);
                }
            }
            Event::AvailabilityUpdated { availability } => {
                let prev_area = self
                    .availability_to_area
                    .get(&availability.id)
                    .map(|e| *e.value());
                if let Some(prev) = prev_area
                    && prev != availability.area_id
                    && let Some(rs) = guards.get_mut(&prev)
                {
                    rs.remove_availability(availability.id);
                }
                if let Some(rs) = guards.get_mut(&availability.area_id) {
                    rs.upsert_availability(availability.clone());
                    self.availability_to_area
                        .insert(availability.id, availability.area_id);
                }
            }
            Event::AvailabilityRemoved { id, area_id } => {
                if let Some(rs) = guards.get_mut(area_id) {
                    rs.remove_availability(*id);
                }
                self.availability_to_area.remove(id);
            }
            Event::BookingCreated { booking } => {
                self.place_slots(booking, guards);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingUpdated { booking } => {
                if let Some((_, prev)) = self.bookings.remove(&booking.id) {
                    self.clear_slots(&prev, guards);
                }
                self.place_slots(booking, guards);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingDeleted { id } => {
                if let Some((_, prev)) = self.bookings.remove(id) {
                    self.clear_slots(&prev, guards);
                }
            }
            Event::PatternCreated { pattern } | Event::PatternUpdated { pattern } => {
                self.patterns.insert(pattern.id, pattern.clone());
            }
            Event::PatternDeleted { id } => {
                self.patterns.remove(id);
            }
        }
    }

    fn place_slots(&self, booking: &Booking, guards: &mut AreaGuards) {
        let slot = BookedSlot {
            booking_id: booking.id,
            range: booking.range,
        };
        for area_id in booking.area_ids() {
            if let Some(rs) = guards.get_mut(&area_id) {
                rs.insert_slot(booking.date, slot);
            }
        }
    }

    fn clear_slots(&self, booking: &Booking, guards: &mut AreaGuards) {
        for area_id in booking.area_ids() {
            if let Some(rs) = guards.get_mut(&area_id) {
                rs.remove_slot(booking.date, booking.id);
            }
        }
    }

    /// Write `events` to the WAL as one frame, then apply them. On a WAL
    /// failure nothing is applied.
    pub(super) async fn commit(&self, events: Vec<Event>, guards: &mut AreaGuards) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        self.wal_append(events.clone()).await?;
        for event in &events {
            self.apply(event, guards);
        }
        Ok(())
    }

    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no commit can land between the snapshot and the swap.
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        let area_states: Vec<SharedAreaState> = self.areas.iter().map(|e| e.value().clone()).collect();
        for rs in area_states {
            let guard = rs.read().await;
            events.push(Event::AreaCreated {
                area: guard.area.clone(),
            });
            for a in &guard.availabilities {
                events.push(Event::AvailabilityAdded {
                    availability: a.clone(),
                });
            }
        }
        for entry in self.bookings.iter() {
            events.push(Event::BookingCreated {
                booking: entry.value().clone(),
            });
        }
        for entry in self.patterns.iter() {
            events.push(Event::PatternCreated {
                pattern: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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
