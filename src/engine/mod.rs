mod availability;
mod catalog;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod occupancy;
mod queries;
mod quota;
mod store;

pub use availability::{Directory, SpaceChain, is_bookable, resolve_bookable, resolve_chain};
pub use catalog::Catalog;
pub use conflict::{find_conflict, live_reservations};
pub use error::{EngineError, StateError};
pub use lifecycle::Transition;
pub use occupancy::occupancy;
pub use quota::count_overlapping;
pub use store::{ReservationKey, ReservationStore};

pub(crate) use conflict::now_ms;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::error;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<SpaceSchedule>>;
pub type SharedLedger = Arc<Mutex<UserLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!(events = batch.len(), "WAL flush failed: {e}");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
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
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Locks held for one reservation change: the owner's ledger, then the
/// space's schedule. Acquired in that order, always.
pub(super) struct BookingScope {
    pub ledger: OwnedMutexGuard<UserLedger>,
    pub schedule: OwnedRwLockWriteGuard<SpaceSchedule>,
}

pub struct Engine {
    pub catalog: Catalog,
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) store: ReservationStore,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot it writes is never missing a committed event.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let catalog = Catalog::new();
        let store = ReservationStore::new();

        // Nothing is shared yet, so replay into plain maps and wrap afterwards.
        let mut schedules: HashMap<Ulid, SpaceSchedule> = HashMap::new();
        let mut ledgers: HashMap<Ulid, UserLedger> = HashMap::new();
        for event in &events {
            match event.reservation_space() {
                None => {
                    catalog.apply(event);
                    if let Event::SpaceSaved { space } = event {
                        schedules
                            .entry(space.id)
                            .or_insert_with(|| SpaceSchedule::new(space.id));
                    }
                }
                Some(space_id) => {
                    let Some(user_id) = store.owner_of(event) else {
                        continue;
                    };
                    let schedule = schedules
                        .entry(space_id)
                        .or_insert_with(|| SpaceSchedule::new(space_id));
                    let ledger = ledgers
                        .entry(user_id)
                        .or_insert_with(|| UserLedger::new(user_id));
                    store.apply_event(schedule, ledger, event);
                }
            }
        }

        Ok(Self {
            catalog,
            schedules: schedules
                .into_iter()
                .map(|(id, s)| (id, Arc::new(RwLock::new(s))))
                .collect(),
            ledgers: ledgers
                .into_iter()
                .map(|(id, l)| (id, Arc::new(Mutex::new(l))))
                .collect(),
            store,
            commit_gate: RwLock::new(()),
            wal_tx,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreFailure(e.to_string()))
    }

    pub fn schedule(&self, space_id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(space_id).map(|e| e.value().clone())
    }

    pub(super) fn ledger(&self, user_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(UserLedger::new(user_id))))
            .value()
            .clone()
    }

    pub fn reservation_key(&self, id: &Ulid) -> Option<ReservationKey> {
        self.store.key(id)
    }

    /// Lock the user's ledger, then the space's schedule.
    pub(super) async fn lock_scope(
        &self,
        user_id: Ulid,
        space_id: Ulid,
    ) -> Result<BookingScope, EngineError> {
        let schedule = self
            .schedule(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let ledger = self.ledger(user_id).lock_owned().await;
        let schedule = schedule.write_owned().await;
        Ok(BookingScope { ledger, schedule })
    }

    /// Lookup reservation → (owner, space) and lock that scope.
    pub(super) async fn lock_reservation(&self, id: Ulid) -> Result<BookingScope, EngineError> {
        let key = self.store.key(&id).ok_or(EngineError::NotFound(id))?;
        self.lock_scope(key.user_id, key.space_id).await
    }

    /// WAL-append, then apply under the locks the caller already holds.
    pub(super) async fn persist_reservation(
        &self,
        scope: &mut BookingScope,
        event: &Event,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.wal_append(event).await {
            let span = store::event_span(&scope.schedule, event);
            error!(
                space_id = %scope.schedule.space_id,
                user_id = %scope.ledger.user_id,
                start = span.map(|s| s.start),
                end = span.map(|s| s.end),
                "reservation write failed: {e}"
            );
            return Err(e);
        }
        self.store
            .apply_event(&mut scope.schedule, &mut scope.ledger, event);
        Ok(())
    }

    /// WAL-append a catalog event and apply it.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        if let Err(e) = self.wal_append(event).await {
            error!("catalog write failed: {e}");
            return Err(e);
        }
        self.catalog.apply(event);
        if let Event::SpaceSaved { space } = event {
            self.schedules
                .entry(space.id)
                .or_insert_with(|| Arc::new(RwLock::new(SpaceSchedule::new(space.id))));
        }
        Ok(())
    }
}
