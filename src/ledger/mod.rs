mod conflict;
mod error;
mod mutations;
mod queries;
pub mod slots;
mod store;
#[cfg(test)]
mod tests;

pub use error::LedgerError;
pub use slots::{find_slot, materialize, merge_overlapping, split_into_slots};
pub use store::RecordStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedInspectorState = Arc<RwLock<InspectorState>>;

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
/// 5. Respond to all senders.
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

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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

// ── Ledger ───────────────────────────────────────────────

/// The availability ledger: inspectors, their templates and overrides, every
/// pinned slot, and the reference records appointments point at.
pub struct Ledger {
    pub(super) inspectors: DashMap<Ulid, SharedInspectorState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// appointment id → (inspector id, slot id)
    pub(super) appointments: DashMap<Ulid, (Ulid, Ulid)>,
    /// Appointment and charge ids claimed by a write still in flight.
    pub(super) pending_ids: DashSet<Ulid>,
    /// template range id → inspector id
    pub(super) template_owner: DashMap<Ulid, Ulid>,
    /// Random part of an inspector id → inspector id. Resolves slot ids.
    pub(super) slot_owner: DashMap<u128, Ulid>,
    pub(super) records: RecordStore,
    /// Shared by bookings; exclusive for record changes, inspector creation
    /// and WAL compaction.
    pub(super) records_lock: RwLock<()>,
}

impl Ledger {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if let Some(offset) = replay.torn_at {
            warn!(
                "WAL {} has a torn or corrupt entry at byte {offset}; truncating",
                wal_path.display()
            );
            Wal::truncate(&wal_path, offset)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            inspectors: DashMap::new(),
            wal_tx,
            notify,
            appointments: DashMap::new(),
            pending_ids: DashSet::new(),
            template_owner: DashMap::new(),
            slot_owner: DashMap::new(),
            records: RecordStore::new(),
            records_lock: RwLock::new(()),
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // blocking_write would panic inside the runtime.
        for event in &replay.events {
            match event {
                Event::InspectorCreated { .. } | Event::InspectorDeleted { .. } => {
                    ledger.apply_lifecycle(event);
                }
                other => match other.inspector_id() {
                    Some(inspector_id) => {
                        if let Some(rs) = ledger.get_inspector(&inspector_id)
                            && let Ok(mut guard) = rs.try_write()
                        {
                            ledger.apply_to_inspector(&mut guard, other);
                        }
                    }
                    None => ledger.records.apply(other),
                },
            }
        }

        info!(
            "replayed {} events from {} ({} inspectors, {} appointments)",
            replay.events.len(),
            wal_path.display(),
            ledger.inspectors.len(),
            ledger.appointments.len()
        );
        Ok(ledger)
    }

    /// Inspector creation and deletion act on the maps, not on one inspector.
    fn apply_lifecycle(&self, event: &Event) {
        match event {
            Event::InspectorCreated {
                id,
                name,
                slot_minutes,
            } => {
                let st = InspectorState::new(*id, name.clone(), *slot_minutes);
                self.inspectors.insert(*id, Arc::new(RwLock::new(st)));
                self.slot_owner.insert(id.random(), *id);
            }
            Event::InspectorDeleted { id } => {
                self.inspectors.remove(id);
                self.slot_owner.remove(&id.random());
                self.template_owner.retain(|_, owner| *owner != *id);
            }
            _ => {}
        }
    }

    /// Apply an event to an inspector (no locking; caller holds the lock).
    fn apply_to_inspector(&self, st: &mut InspectorState, event: &Event) {
        match event {
            Event::InspectorUpdated {
                name, slot_minutes, ..
            } => {
                st.name = name.clone();
                st.slot_minutes = *slot_minutes;
            }
            Event::TemplateRangeAdded {
                id,
                inspector_id,
                weekday,
                range,
            } => {
                st.template.push(TemplateRange {
                    id: *id,
                    weekday: *weekday,
                    range: *range,
                });
                self.template_owner.insert(*id, *inspector_id);
            }
            Event::TemplateRangeRemoved { id, .. } => {
                st.template.retain(|t| t.id != *id);
                self.template_owner.remove(id);
            }
            Event::OverrideSet { date, ranges, .. } => {
                st.overrides.insert(*date, ranges.clone());
            }
            Event::OverrideCleared { date, .. } => {
                st.overrides.remove(date);
            }
            Event::AppointmentBooked { appointment } => {
                st.insert_allocation(Allocation {
                    slot_id: appointment.slot_id,
                    span: appointment.span,
                    kind: AllocationKind::Appointment(appointment.clone()),
                });
                self.appointments
                    .insert(appointment.id, (appointment.inspector_id, appointment.slot_id));
                self.records.retain_refs(appointment);
            }
            Event::AppointmentCancelled { slot_id, .. } => {
                if let Some(removed) = st.remove_allocation(*slot_id) {
                    self.forget(&removed);
                }
            }
            Event::SlotReset { slot_id, .. } => {
                st.remove_allocation(*slot_id);
                self.records.void_unpaid_charge(*slot_id);
            }
            Event::SlotMarkedUnproductive {
                slot_id,
                span,
                reason,
                marked_at,
                charge,
                ..
            } => {
                st.insert_allocation(Allocation {
                    slot_id: *slot_id,
                    span: *span,
                    kind: AllocationKind::Unproductive {
                        reason: reason.clone(),
                        marked_at: *marked_at,
                    },
                });
                if let Some(charge) = charge {
                    self.records.add_charge(charge);
                }
            }
            Event::HistoryPurged { before, .. } => {
                let cutoff = day_start(*before);
                let split = st.allocations.partition_point(|a| a.span.start < cutoff);
                let purged: Vec<Allocation> = st.allocations.drain(..split).collect();
                for removed in &purged {
                    self.forget(removed);
                }
                st.overrides = st.overrides.split_off(before);
                self.records.purge_paid_charges(st.id, *before);
            }
            Event::InspectorCreated { .. }
            | Event::InspectorDeleted { .. }
            | Event::ClientRegistered(_)
            | Event::ClientRemoved { .. }
            | Event::AgencyRegistered(_)
            | Event::AgencyRemoved { .. }
            | Event::PropertyRegistered(_)
            | Event::PropertyRemoved { .. }
            | Event::ChargeRestored(_)
            | Event::ChargePaid { .. } => {}
        }
    }

    /// Drop the indexes a removed allocation kept alive.
    fn forget(&self, removed: &Allocation) {
        if let AllocationKind::Appointment(a) = &removed.kind {
            self.appointments.remove(&a.id);
            self.records.release_refs(a);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))
    }

    pub fn get_inspector(&self, id: &Ulid) -> Option<SharedInspectorState> {
        self.inspectors.get(id).map(|e| e.value().clone())
    }

    pub(super) fn inspector(&self, id: Ulid) -> Result<SharedInspectorState, LedgerError> {
        self.get_inspector(&id).ok_or(LedgerError::NotFound(id))
    }

    /// Acquire an inspector's write lock.
    pub(super) async fn write_inspector(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<InspectorState>, LedgerError> {
        let guard = self.inspector(id)?.write_owned().await;
        // Deleted while we waited for the lock.
        if !self.inspectors.contains_key(&id) {
            return Err(LedgerError::NotFound(id));
        }
        Ok(guard)
    }

    /// The inspector owning a slot id.
    pub(super) fn slot_inspector(&self, slot_id: Ulid) -> Result<Ulid, LedgerError> {
        self.slot_owner
            .get(&slot_id.random())
            .map(|e| *e.value())
            .ok_or(LedgerError::NotFound(slot_id))
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        inspector_id: Ulid,
        st: &mut InspectorState,
        event: &Event,
    ) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        self.apply_to_inspector(st, event);
        self.notify.send(inspector_id, event);
        Ok(())
    }

    /// WAL-append + apply for events outside any single inspector.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        match event {
            Event::InspectorCreated { .. } | Event::InspectorDeleted { .. } => {
                self.apply_lifecycle(event)
            }
            other => self.records.apply(other),
        }
        Ok(())
    }

    /// Lookup appointment → inspector, acquire the inspector's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: Ulid,
    ) -> Result<(Ulid, Ulid, tokio::sync::OwnedRwLockWriteGuard<InspectorState>), LedgerError> {
        let (inspector_id, slot_id) = self
            .appointments
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(LedgerError::NotFound(appointment_id))?;
        let guard = self.write_inspector(inspector_id).await?;
        Ok((inspector_id, slot_id, guard))
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Claim an appointment id for one booking. Fails if the id is booked
    /// or another booking holds it. Released on drop.
    pub(super) fn reserve_appointment(&self, id: Ulid) -> Result<IdReservation<'_>, LedgerError> {
        self.reserve(id, |id| self.appointments.contains_key(id))
    }

    /// Claim a charge id, as `reserve_appointment` does for bookings.
    pub(super) fn reserve_charge(&self, id: Ulid) -> Result<IdReservation<'_>, LedgerError> {
        self.reserve(id, |id| self.records.charge(id).is_some())
    }

    fn reserve(&self, id: Ulid, taken: impl Fn(&Ulid) -> bool) -> Result<IdReservation<'_>, LedgerError> {
        if !self.pending_ids.insert(id) {
            return Err(LedgerError::AlreadyExists(id));
        }
        let reservation = IdReservation {
            pending: &self.pending_ids,
            id,
        };
        if taken(&id) {
            return Err(LedgerError::AlreadyExists(id));
        }
        Ok(reservation)
    }
}

/// An id claimed by an in-flight write.
pub(super) struct IdReservation<'a> {
    pending: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Dates from `from` through `to`, inclusive.
pub(super) fn dates(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |d| *d <= to)
}
