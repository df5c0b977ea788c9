use chrono::{NaiveDate, Weekday};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::fees;
use crate::limits::*;
use crate::model::*;
use crate::records::{Agency, Client, Property};
use crate::session::Session;

use super::conflict::{
    check_disjoint, check_free, now_ms, validate_date, validate_slot_minutes, validate_text,
};
use super::slots::find_slot;
use super::{Ledger, LedgerError, WalCommand};

impl Ledger {
    // ── Inspectors ───────────────────────────────────────────

    pub async fn create_inspector(
        &self,
        session: &Session,
        id: Ulid,
        name: &str,
        slot_minutes: Option<u32>,
    ) -> Result<(), LedgerError> {
        session.require_admin()?;
        let name = validate_text("name", name, MAX_NAME_LEN)?;
        let slot_minutes = slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES);
        validate_slot_minutes(slot_minutes)?;
        let _records = self.records_lock.write().await;
        if self.inspectors.len() >= MAX_INSPECTORS {
            return Err(LedgerError::LimitExceeded("too many inspectors"));
        }
        if self.inspectors.contains_key(&id) {
            return Err(LedgerError::AlreadyExists(id));
        }
        // Slot ids are keyed by the random half of the inspector id.
        if let Some(other) = self.slot_owner.get(&id.random()) {
            return Err(LedgerError::AlreadyExists(*other.value()));
        }

        let event = Event::InspectorCreated {
            id,
            name,
            slot_minutes,
        };
        self.persist_global(&event).await?;
        info!("created inspector {id}");
        Ok(())
    }

    pub async fn update_inspector(
        &self,
        session: &Session,
        id: Ulid,
        name: &str,
        slot_minutes: u32,
    ) -> Result<(), LedgerError> {
        session.require_admin()?;
        let name = validate_text("name", name, MAX_NAME_LEN)?;
        validate_slot_minutes(slot_minutes)?;
        let mut guard = self.write_inspector(id).await?;

        let event = Event::InspectorUpdated {
            id,
            name,
            slot_minutes,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Fails with `InUse` while the inspector still has pinned slots.
    pub async fn delete_inspector(&self, session: &Session, id: Ulid) -> Result<(), LedgerError> {
        session.require_admin()?;
        let guard = self.write_inspector(id).await?;
        if !guard.allocations.is_empty() {
            return Err(LedgerError::InUse(id));
        }

        let event = Event::InspectorDeleted { id };
        self.persist_global(&event).await?;
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("deleted inspector {id}");
        Ok(())
    }

    // ── Template & overrides ─────────────────────────────────

    pub async fn add_template_range(
        &self,
        session: &Session,
        id: Ulid,
        inspector_id: Ulid,
        weekday: Weekday,
        range: TimeRange,
    ) -> Result<(), LedgerError> {
        session.require_access(inspector_id)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        if self.template_owner.contains_key(&id) {
            return Err(LedgerError::AlreadyExists(id));
        }
        if guard.template.len() >= MAX_TEMPLATE_RANGES {
            return Err(LedgerError::LimitExceeded("too many template ranges"));
        }

        let event = Event::TemplateRangeAdded {
            id,
            inspector_id,
            weekday,
            range,
        };
        self.persist_and_apply(inspector_id, &mut guard, &event).await
    }

    pub async fn remove_template_range(&self, session: &Session, id: Ulid) -> Result<(), LedgerError> {
        let inspector_id = self
            .template_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(LedgerError::NotFound(id))?;
        session.require_access(inspector_id)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        if !guard.template.iter().any(|t| t.id == id) {
            return Err(LedgerError::NotFound(id));
        }

        let event = Event::TemplateRangeRemoved { id, inspector_id };
        self.persist_and_apply(inspector_id, &mut guard, &event).await
    }

    /// Replace the derived availability of one date. An empty `ranges`
    /// closes the day.
    pub async fn set_override(
        &self,
        session: &Session,
        inspector_id: Ulid,
        date: NaiveDate,
        mut ranges: Vec<TimeRange>,
    ) -> Result<(), LedgerError> {
        session.require_access(inspector_id)?;
        validate_date(date)?;
        if ranges.len() > MAX_OVERRIDE_RANGES {
            return Err(LedgerError::LimitExceeded("too many override ranges"));
        }
        check_disjoint(&mut ranges)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        if !guard.overrides.contains_key(&date) && guard.overrides.len() >= MAX_OVERRIDES_PER_INSPECTOR {
            return Err(LedgerError::LimitExceeded("too many overrides"));
        }

        let event = Event::OverrideSet {
            inspector_id,
            date,
            ranges,
        };
        self.persist_and_apply(inspector_id, &mut guard, &event).await
    }

    /// Return `date` to the weekly template. `Ok(false)` if no override was set.
    pub async fn clear_override(
        &self,
        session: &Session,
        inspector_id: Ulid,
        date: NaiveDate,
    ) -> Result<bool, LedgerError> {
        session.require_access(inspector_id)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        if !guard.overrides.contains_key(&date) {
            return Ok(false);
        }

        let event = Event::OverrideCleared { inspector_id, date };
        self.persist_and_apply(inspector_id, &mut guard, &event).await?;
        Ok(true)
    }

    // ── Slot transitions ─────────────────────────────────────

    /// Book `slot_id`. The slot is re-derived and checked under the
    /// inspector's write lock; the WAL append happens before the lock is
    /// released, so of two concurrent bookings exactly one succeeds.
    pub async fn book(
        &self,
        session: &Session,
        id: Ulid,
        slot_id: Ulid,
        request: BookingRequest,
    ) -> Result<Appointment, LedgerError> {
        session.require_admin()?;
        // Held until the booking is applied so referenced records can't be
        // removed underneath it.
        let _records = self.records_lock.read().await;
        // The id is indexed on apply, before the reservation drops.
        let _reservation = self.reserve_appointment(id)?;
        let client = self
            .records
            .client(&request.client_id)
            .ok_or(LedgerError::NotFound(request.client_id))?;
        let agency = self
            .records
            .agency(&request.agency_id)
            .ok_or(LedgerError::NotFound(request.agency_id))?;
        let property = self
            .records
            .property(&request.property_id)
            .ok_or(LedgerError::NotFound(request.property_id))?;
        if property.client_id() != client.id() || property.agency_id() != agency.id() {
            return Err(LedgerError::Validation(format!(
                "property {} does not belong to client {} and agency {}",
                property.id(),
                client.id(),
                agency.id()
            )));
        }

        let inspector_id = self.slot_inspector(slot_id)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        if guard.allocations.len() >= MAX_ALLOCATIONS_PER_INSPECTOR {
            return Err(LedgerError::LimitExceeded("too many pinned slots"));
        }
        let slot = find_slot(&guard, slot_id).ok_or(LedgerError::NotFound(slot_id))?;
        validate_date(slot.date)?;
        if let Err(e) = check_free(&slot) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let appointment = Appointment {
            id,
            slot_id,
            inspector_id,
            span: slot.span,
            client_id: client.id(),
            agency_id: agency.id(),
            property_id: property.id(),
            kind: request.kind,
            fee_cents: fees::inspection_fee(&property, &agency, request.kind),
            payout_cents: fees::inspector_payout(&property, request.kind),
            booked_at: now_ms(),
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(inspector_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        debug!("booked {id} into slot {slot_id} of inspector {inspector_id}");
        Ok(appointment)
    }

    /// Cancel an appointment; its slot returns to Free.
    pub async fn cancel(&self, session: &Session, id: Ulid) -> Result<(), LedgerError> {
        session.require_admin()?;
        let (inspector_id, slot_id, mut guard) = self.resolve_appointment_write(id).await?;
        // A concurrent cancel may have won the lock first.
        match guard.allocation(slot_id).map(|a| &a.kind) {
            Some(AllocationKind::Appointment(a)) if a.id == id => {}
            _ => return Err(LedgerError::NotFound(id)),
        }

        let event = Event::AppointmentCancelled {
            id,
            inspector_id,
            slot_id,
        };
        self.persist_and_apply(inspector_id, &mut guard, &event).await?;
        debug!("cancelled {id}, slot {slot_id} is free");
        Ok(())
    }

    /// Free → Unproductive. `reason` is required.
    pub async fn mark_unproductive(
        &self,
        session: &Session,
        slot_id: Ulid,
        reason: &str,
    ) -> Result<(), LedgerError> {
        self.mark(session, slot_id, reason, None).await
    }

    /// Free → Unproductive, charging the client for the visit. The
    /// inspector is paid a share of the charge. Admin only.
    pub async fn mark_unproductive_billed(
        &self,
        session: &Session,
        slot_id: Ulid,
        reason: &str,
        request: ChargeRequest,
    ) -> Result<Charge, LedgerError> {
        session.require_admin()?;
        let _records = self.records_lock.read().await;
        let _reservation = self.reserve_charge(request.id)?;
        if self.records.charge_count() >= MAX_CHARGES {
            return Err(LedgerError::LimitExceeded("too many charges"));
        }
        let agency_id = self.check_charge_records(&request)?;
        self.mark(session, slot_id, reason, Some((request, agency_id)))
            .await?;
        self.records
            .charge(&request.id)
            .ok_or(LedgerError::NotFound(request.id))
    }

    /// Resolve and cross-check the records a charge points at. Returns the
    /// agency billed, which defaults to the property's.
    fn check_charge_records(&self, request: &ChargeRequest) -> Result<Option<Ulid>, LedgerError> {
        if !(1..=MAX_CHARGE_CENTS).contains(&request.amount_cents) {
            return Err(LedgerError::Validation(format!(
                "charge must be between 1 and {MAX_CHARGE_CENTS} cents, got {}",
                request.amount_cents
            )));
        }
        if self.records.client(&request.client_id).is_none() {
            return Err(LedgerError::NotFound(request.client_id));
        }
        if let Some(agency_id) = request.agency_id
            && self.records.agency(&agency_id).is_none()
        {
            return Err(LedgerError::NotFound(agency_id));
        }
        let Some(property_id) = request.property_id else {
            return Ok(request.agency_id);
        };
        let property = self
            .records
            .property(&property_id)
            .ok_or(LedgerError::NotFound(property_id))?;
        if property.client_id() != request.client_id
            || request.agency_id.is_some_and(|a| a != property.agency_id())
        {
            return Err(LedgerError::Validation(format!(
                "property {property_id} does not belong to client {} and the agency billed",
                request.client_id
            )));
        }
        Ok(Some(property.agency_id()))
    }

    async fn mark(
        &self,
        session: &Session,
        slot_id: Ulid,
        reason: &str,
        billing: Option<(ChargeRequest, Option<Ulid>)>,
    ) -> Result<(), LedgerError> {
        // Decided from the slot id alone, so a missing owner reads the same
        // as someone else's.
        session.require_slot_access(slot_id)?;
        let inspector_id = self.slot_inspector(slot_id)?;
        session.require_access(inspector_id)?;
        let reason = validate_text("reason", reason, MAX_REASON_LEN)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        if guard.allocations.len() >= MAX_ALLOCATIONS_PER_INSPECTOR {
            return Err(LedgerError::LimitExceeded("too many pinned slots"));
        }
        let slot = find_slot(&guard, slot_id).ok_or(LedgerError::NotFound(slot_id))?;
        validate_date(slot.date)?;
        check_free(&slot)?;

        let marked_at = now_ms();
        let charge = billing.map(|(request, agency_id)| Charge {
            id: request.id,
            slot_id,
            inspector_id,
            date: slot.date,
            client_id: request.client_id,
            agency_id,
            property_id: request.property_id,
            reason: reason.clone(),
            amount_cents: request.amount_cents,
            payout_cents: fees::unproductive_payout(request.amount_cents),
            marked_at,
            paid_at: None,
        });
        let event = Event::SlotMarkedUnproductive {
            slot_id,
            inspector_id,
            span: slot.span,
            reason,
            marked_at,
            charge,
        };
        self.persist_and_apply(inspector_id, &mut guard, &event).await?;
        debug!("slot {slot_id} marked unproductive");
        Ok(())
    }

    /// Unproductive → Free. Admin only. A free slot is left as is.
    pub async fn reset_slot(&self, session: &Session, slot_id: Ulid) -> Result<(), LedgerError> {
        session.require_admin()?;
        let inspector_id = self.slot_inspector(slot_id)?;
        let mut guard = self.write_inspector(inspector_id).await?;
        match guard.allocation(slot_id).map(|a| &a.kind) {
            Some(AllocationKind::Appointment(_)) => {
                return Err(LedgerError::SlotUnavailable {
                    slot: slot_id,
                    state: "booked",
                });
            }
            Some(AllocationKind::Unproductive { .. }) => {}
            None => {
                return match find_slot(&guard, slot_id) {
                    Some(_) => Ok(()),
                    None => Err(LedgerError::NotFound(slot_id)),
                };
            }
        }

        let event = Event::SlotReset {
            slot_id,
            inspector_id,
        };
        self.persist_and_apply(inspector_id, &mut guard, &event).await?;
        debug!("slot {slot_id} reset to free");
        Ok(())
    }

    // ── Reference records ────────────────────────────────────

    async fn register_record(&self, session: &Session, id: Ulid, event: Event) -> Result<(), LedgerError> {
        session.require_admin()?;
        let _records = self.records_lock.write().await;
        if self.records.contains(&id) {
            return Err(LedgerError::AlreadyExists(id));
        }
        if self.records.len() >= MAX_RECORDS {
            return Err(LedgerError::LimitExceeded("too many records"));
        }
        if let Event::PropertyRegistered(p) = &event {
            if self.records.client(&p.client_id()).is_none() {
                return Err(LedgerError::NotFound(p.client_id()));
            }
            if self.records.agency(&p.agency_id()).is_none() {
                return Err(LedgerError::NotFound(p.agency_id()));
            }
        }
        self.persist_global(&event).await
    }

    pub async fn register_client(&self, session: &Session, client: Client) -> Result<(), LedgerError> {
        self.register_record(session, client.id(), Event::ClientRegistered(client))
            .await
    }

    pub async fn register_agency(&self, session: &Session, agency: Agency) -> Result<(), LedgerError> {
        self.register_record(session, agency.id(), Event::AgencyRegistered(agency))
            .await
    }

    pub async fn register_property(&self, session: &Session, property: Property) -> Result<(), LedgerError> {
        self.register_record(session, property.id(), Event::PropertyRegistered(property))
            .await
    }

    pub async fn remove_client(&self, session: &Session, id: Ulid) -> Result<(), LedgerError> {
        session.require_admin()?;
        let _records = self.records_lock.write().await;
        if self.records.client(&id).is_none() {
            return Err(LedgerError::NotFound(id));
        }
        if self.records.ref_count(&id) > 0 || self.records.has_properties(&id) {
            return Err(LedgerError::InUse(id));
        }
        self.persist_global(&Event::ClientRemoved { id }).await
    }

    pub async fn remove_agency(&self, session: &Session, id: Ulid) -> Result<(), LedgerError> {
        session.require_admin()?;
        let _records = self.records_lock.write().await;
        if self.records.agency(&id).is_none() {
            return Err(LedgerError::NotFound(id));
        }
        if self.records.ref_count(&id) > 0 || self.records.has_properties(&id) {
            return Err(LedgerError::InUse(id));
        }
        self.persist_global(&Event::AgencyRemoved { id }).await
    }

    pub async fn remove_property(&self, session: &Session, id: Ulid) -> Result<(), LedgerError> {
        session.require_admin()?;
        let _records = self.records_lock.write().await;
        if self.records.property(&id).is_none() {
            return Err(LedgerError::NotFound(id));
        }
        if self.records.ref_count(&id) > 0 {
            return Err(LedgerError::InUse(id));
        }
        self.persist_global(&Event::PropertyRemoved { id }).await
    }

    // ── Charges ──────────────────────────────────────────────

    /// Settle a charge. `Ok(false)` if it was already paid.
    pub async fn pay_charge(&self, session: &Session, id: Ulid) -> Result<bool, LedgerError> {
        session.require_admin()?;
        let _records = self.records_lock.write().await;
        let charge = self.records.charge(&id).ok_or(LedgerError::NotFound(id))?;
        if charge.is_paid() {
            return Ok(false);
        }
        let event = Event::ChargePaid {
            id,
            paid_at: now_ms(),
        };
        self.persist_global(&event).await?;
        self.notify.send(charge.inspector_id, &event);
        info!("charge {id} paid by client {}", charge.client_id);
        Ok(true)
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Drop appointments, unproductive marks and overrides dated before
    /// `before`, one `HistoryPurged` event per affected inspector.
    pub async fn purge_history(&self, before: NaiveDate) -> Result<PurgeReport, LedgerError> {
        validate_date(before)?;
        let cutoff = day_start(before);
        let ids: Vec<Ulid> = self.inspectors.iter().map(|e| *e.key()).collect();
        let mut report = PurgeReport::default();

        for inspector_id in ids {
            let Some(rs) = self.get_inspector(&inspector_id) else {
                continue;
            };
            let mut guard = rs.write().await;
            let mut found = PurgeReport::default();
            for a in guard.allocations.iter().take_while(|a| a.span.start < cutoff) {
                match a.kind {
                    AllocationKind::Appointment(_) => found.appointments += 1,
                    AllocationKind::Unproductive { .. } => found.unproductive += 1,
                }
            }
            found.overrides = guard.overrides.range(..before).count();
            if found.is_empty() {
                continue;
            }

            let event = Event::HistoryPurged {
                inspector_id,
                before,
            };
            self.persist_and_apply(inspector_id, &mut guard, &event).await?;
            report.appointments += found.appointments;
            report.unproductive += found.unproductive;
            report.overrides += found.overrides;
        }

        metrics::counter!(crate::observability::RETENTION_PURGED_TOTAL)
            .increment((report.appointments + report.unproductive) as u64);
        Ok(report)
    }

    /// Rewrite the WAL as the minimal event set recreating current state.
    /// Every mutation is held off until the new file is in place, so nothing
    /// appended after the snapshot is lost by the swap.
    pub async fn compact_wal(&self) -> Result<(), LedgerError> {
        let _records = self.records_lock.write().await;
        let mut events = self.records.snapshot();

        let mut rs_list: Vec<(Ulid, _)> = self
            .inspectors
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rs_list.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(rs_list.len());
        for (id, rs) in rs_list {
            let guard = rs.read_owned().await;
            // Deleted while we waited for the lock.
            if self.inspectors.contains_key(&id) {
                guards.push(guard);
            }
        }
        for guard in &guards {
            events.extend(snapshot_inspector(guard));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
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

/// Events recreating one inspector.
fn snapshot_inspector(st: &InspectorState) -> Vec<Event> {
    let mut events = vec![Event::InspectorCreated {
        id: st.id,
        name: st.name.clone(),
        slot_minutes: st.slot_minutes,
    }];
    for t in &st.template {
        events.push(Event::TemplateRangeAdded {
            id: t.id,
            inspector_id: st.id,
            weekday: t.weekday,
            range: t.range,
        });
    }
    for (date, ranges) in &st.overrides {
        events.push(Event::OverrideSet {
            inspector_id: st.id,
            date: *date,
            ranges: ranges.clone(),
        });
    }
    for a in &st.allocations {
        events.push(match &a.kind {
            AllocationKind::Appointment(appointment) => Event::AppointmentBooked {
                appointment: appointment.clone(),
            },
            // Charges are restored with the records.
            AllocationKind::Unproductive { reason, marked_at } => Event::SlotMarkedUnproductive {
                slot_id: a.slot_id,
                inspector_id: st.id,
                span: a.span,
                reason: reason.clone(),
                marked_at: *marked_at,
                charge: None,
            },
        });
    }
    events
}
