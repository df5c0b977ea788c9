use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Appointment, Charge, ChargeFilter, Event};
use crate::records::{Agency, Client, Property};

/// Clients, agencies and properties, the charges raised against clients,
/// and how many live appointments and unpaid charges reference each record.
#[derive(Default)]
pub struct RecordStore {
    clients: DashMap<Ulid, Client>,
    agencies: DashMap<Ulid, Agency>,
    properties: DashMap<Ulid, Property>,
    charges: DashMap<Ulid, Charge>,
    refs: DashMap<Ulid, u32>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, id: &Ulid) -> Option<Client> {
        self.clients.get(id).map(|e| e.value().clone())
    }

    pub fn agency(&self, id: &Ulid) -> Option<Agency> {
        self.agencies.get(id).map(|e| e.value().clone())
    }

    pub fn property(&self, id: &Ulid) -> Option<Property> {
        self.properties.get(id).map(|e| e.value().clone())
    }

    /// Whether any record of any kind uses this id.
    pub fn contains(&self, id: &Ulid) -> bool {
        self.clients.contains_key(id)
            || self.agencies.contains_key(id)
            || self.properties.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len() + self.agencies.len() + self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live appointments and unpaid charges referencing `id`.
    pub fn ref_count(&self, id: &Ulid) -> u32 {
        self.refs.get(id).map(|e| *e.value()).unwrap_or(0)
    }

    /// Whether any property belongs to this client or agency.
    pub fn has_properties(&self, owner: &Ulid) -> bool {
        self.properties
            .iter()
            .any(|p| p.client_id() == *owner || p.agency_id() == *owner)
    }

    pub(super) fn retain_refs(&self, appointment: &Appointment) {
        self.retain_ids([appointment.client_id, appointment.agency_id, appointment.property_id]);
    }

    pub(super) fn release_refs(&self, appointment: &Appointment) {
        self.release_ids([appointment.client_id, appointment.agency_id, appointment.property_id]);
    }

    fn retain_ids(&self, ids: impl IntoIterator<Item = Ulid>) {
        for id in ids {
            *self.refs.entry(id).or_insert(0) += 1;
        }
    }

    fn release_ids(&self, ids: impl IntoIterator<Item = Ulid>) {
        for id in ids {
            if let Some(mut count) = self.refs.get_mut(&id) {
                *count = count.saturating_sub(1);
            }
            self.refs.remove_if(&id, |_, count| *count == 0);
        }
    }

    // ── Charges ──────────────────────────────────────────────

    pub fn charge(&self, id: &Ulid) -> Option<Charge> {
        self.charges.get(id).map(|e| e.value().clone())
    }

    pub fn charge_count(&self) -> usize {
        self.charges.len()
    }

    /// What `client_id` still owes, in cents.
    pub fn client_balance(&self, client_id: &Ulid) -> i64 {
        self.charges
            .iter()
            .filter(|c| c.client_id == *client_id && !c.is_paid())
            .map(|c| c.amount_cents)
            .sum()
    }

    /// Matching charges, oldest visit first.
    pub fn charges(&self, filter: &ChargeFilter) -> Vec<Charge> {
        let mut out: Vec<Charge> = self
            .charges
            .iter()
            .filter(|c| filter.matches(c.value()))
            .map(|c| c.value().clone())
            .collect();
        out.sort_by_key(|c| (c.date, c.marked_at, c.id));
        out
    }

    pub(super) fn add_charge(&self, charge: &Charge) {
        if !charge.is_paid() {
            self.retain_ids(charge.refs());
        }
        self.charges.insert(charge.id, charge.clone());
    }

    /// Drop the unpaid charge raised for `slot_id`, if any. Paid charges
    /// stay on record.
    pub(super) fn void_unpaid_charge(&self, slot_id: Ulid) {
        let Some(id) = self
            .charges
            .iter()
            .find(|c| c.slot_id == slot_id && !c.is_paid())
            .map(|c| c.id)
        else {
            return;
        };
        if let Some((_, charge)) = self.charges.remove(&id) {
            self.release_ids(charge.refs());
        }
    }

    /// Drop `inspector_id`'s paid charges dated before `before`. What is
    /// still owed is kept.
    pub(super) fn purge_paid_charges(&self, inspector_id: Ulid, before: NaiveDate) {
        self.charges
            .retain(|_, c| !(c.inspector_id == inspector_id && c.is_paid() && c.date < before));
    }

    /// Apply a record event. Other events are ignored.
    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::ClientRegistered(c) => {
                self.clients.insert(c.id(), c.clone());
            }
            Event::ClientRemoved { id } => {
                self.clients.remove(id);
            }
            Event::AgencyRegistered(a) => {
                self.agencies.insert(a.id(), a.clone());
            }
            Event::AgencyRemoved { id } => {
                self.agencies.remove(id);
            }
            Event::PropertyRegistered(p) => {
                self.properties.insert(p.id(), p.clone());
            }
            Event::PropertyRemoved { id } => {
                self.properties.remove(id);
            }
            Event::ChargeRestored(charge) => self.add_charge(charge),
            Event::ChargePaid { id, paid_at } => {
                let released = match self.charges.get_mut(id) {
                    Some(mut charge) if !charge.is_paid() => {
                        charge.paid_at = Some(*paid_at);
                        Some(charge.refs().collect::<Vec<_>>())
                    }
                    _ => None,
                };
                if let Some(ids) = released {
                    self.release_ids(ids);
                }
            }
            _ => {}
        }
    }

    /// Events recreating every record and charge, in dependency order.
    pub(super) fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.len() + self.charges.len());
        events.extend(self.clients.iter().map(|c| Event::ClientRegistered(c.value().clone())));
        events.extend(self.agencies.iter().map(|a| Event::AgencyRegistered(a.value().clone())));
        events.extend(
            self.properties
                .iter()
                .map(|p| Event::PropertyRegistered(p.value().clone())),
        );
        events.extend(
            self.charges(&ChargeFilter::default())
                .into_iter()
                .map(Event::ChargeRestored),
        );
        events
    }

    pub fn clients(&self) -> Vec<Client> {
        let mut out: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.id());
        out
    }

    pub fn agencies(&self) -> Vec<Agency> {
        let mut out: Vec<Agency> = self.agencies.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|a| a.id());
        out
    }

    pub fn properties(&self) -> Vec<Property> {
        let mut out: Vec<Property> = self.properties.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id());
        out
    }
}
