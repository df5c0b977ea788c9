use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::records::{Agency, Client, Property};
use crate::session::{Role, Session};

use super::conflict::validate_window;
use super::slots::materialize;
use super::{dates, Ledger, LedgerError};

impl Ledger {
    /// Every slot of `inspector_id` from `from` through `to`, in time order.
    pub async fn list_slots(
        &self,
        session: &Session,
        inspector_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, LedgerError> {
        session.require_access(inspector_id)?;
        validate_window(from, to, MAX_QUERY_DAYS)?;
        let rs = self.inspector(inspector_id)?;
        let guard = rs.read().await;
        Ok(dates(from, to).flat_map(|d| materialize(&guard, d)).collect())
    }

    /// `NotFound` once the appointment is cancelled.
    pub async fn get_appointment(&self, session: &Session, id: Ulid) -> Result<Appointment, LedgerError> {
        let (inspector_id, slot_id) = self
            .appointments
            .get(&id)
            .map(|e| *e.value())
            .ok_or(LedgerError::NotFound(id))?;
        session.require_access(inspector_id)?;
        let rs = self.inspector(inspector_id)?;
        let guard = rs.read().await;
        match guard.allocation(slot_id).map(|a| &a.kind) {
            Some(AllocationKind::Appointment(a)) if a.id == id => Ok(a.clone()),
            _ => Err(LedgerError::NotFound(id)),
        }
    }

    /// Appointments dated `from` through `to`, optionally only those billed
    /// to `agency_id`. Admins see every inspector unless one is named; an
    /// inspector sees only its own.
    pub async fn list_appointments(
        &self,
        session: &Session,
        inspector_id: Option<Ulid>,
        agency_id: Option<Ulid>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Appointment>, LedgerError> {
        validate_window(from, to, MAX_REPORT_DAYS)?;
        let ids: Vec<Ulid> = match (inspector_id, session.role()) {
            (Some(id), _) => {
                session.require_access(id)?;
                self.inspector(id)?;
                vec![id]
            }
            (None, Role::Inspector(me)) => vec![me],
            (None, Role::Admin) => self.inspectors.iter().map(|e| *e.key()).collect(),
        };

        let window = Span::new(day_start(from), day_start(to) + DAY_MS);
        let mut out = Vec::new();
        for id in ids {
            let Some(rs) = self.get_inspector(&id) else {
                continue;
            };
            let guard = rs.read().await;
            out.extend(guard.overlapping(&window).filter_map(|a| match &a.kind {
                AllocationKind::Appointment(appt)
                    if a.span.start >= window.start
                        && agency_id.is_none_or(|id| appt.agency_id == id) =>
                {
                    Some(appt.clone())
                }
                _ => None,
            }));
        }
        out.sort_by_key(|a| (a.span.start, a.inspector_id));
        Ok(out)
    }

    /// Charges raised for unproductive visits. Admin only.
    pub fn list_charges(&self, session: &Session, filter: &ChargeFilter) -> Result<Vec<Charge>, LedgerError> {
        session.require_admin()?;
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            validate_window(from, to, MAX_REPORT_DAYS)?;
        }
        Ok(self.records.charges(filter))
    }

    /// What a client still owes for unproductive visits, in cents.
    pub fn client_balance(&self, session: &Session, client_id: Ulid) -> Result<i64, LedgerError> {
        session.require_admin()?;
        if self.records.client(&client_id).is_none() {
            return Err(LedgerError::NotFound(client_id));
        }
        Ok(self.records.client_balance(&client_id))
    }

    pub async fn list_inspectors(&self) -> Vec<InspectorInfo> {
        let rs_list: Vec<_> = self.inspectors.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rs_list.len());
        for rs in rs_list {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|i| i.id);
        out
    }

    /// Weekly template, ordered by weekday then start time.
    pub async fn get_template(
        &self,
        session: &Session,
        inspector_id: Ulid,
    ) -> Result<Vec<TemplateRange>, LedgerError> {
        session.require_access(inspector_id)?;
        let rs = self.inspector(inspector_id)?;
        let guard = rs.read().await;
        let mut template = guard.template.clone();
        template.sort_by_key(|t| (t.weekday.num_days_from_monday(), t.range));
        Ok(template)
    }

    pub async fn get_overrides(
        &self,
        session: &Session,
        inspector_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(NaiveDate, Vec<TimeRange>)>, LedgerError> {
        session.require_access(inspector_id)?;
        validate_window(from, to, MAX_REPORT_DAYS)?;
        let rs = self.inspector(inspector_id)?;
        let guard = rs.read().await;
        Ok(guard
            .overrides
            .range(from..=to)
            .map(|(d, r)| (*d, r.clone()))
            .collect())
    }

    pub fn get_client(&self, id: Ulid) -> Option<Client> {
        self.records.client(&id)
    }

    pub fn get_agency(&self, id: Ulid) -> Option<Agency> {
        self.records.agency(&id)
    }

    pub fn get_property(&self, id: Ulid) -> Option<Property> {
        self.records.property(&id)
    }
}
