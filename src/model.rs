use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::records::{Agency, Client, Property};

/// Unix milliseconds. Dates are wall-clock days treated as UTC.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The whole of `date`.
    pub fn of_day(date: NaiveDate) -> Self {
        let start = day_start(date);
        Self::new(start, start + DAY_MS)
    }
}

/// Midnight of `date`, in Unix ms.
pub fn day_start(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// The date an instant falls on.
pub fn date_of(ms: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

fn millis_from_midnight(t: NaiveTime) -> Ms {
    t.num_seconds_from_midnight() as Ms * 1000 + (t.nanosecond() / 1_000_000).min(999) as Ms
}

/// Time of day at `ms` milliseconds past midnight.
pub fn time_at(ms: Ms) -> NaiveTime {
    NaiveTime::MIN + TimeDelta::milliseconds(ms.rem_euclid(DAY_MS))
}

/// A wall-clock range within one day, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, crate::ledger::LedgerError> {
        if start >= end {
            return Err(crate::ledger::LedgerError::InvalidRange(format!(
                "{}-{}: start must be before end",
                start.format("%H:%M"),
                end.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Anchor the range on a concrete date.
    pub fn on(&self, date: NaiveDate) -> Span {
        let base = day_start(date);
        Span::new(
            base + millis_from_midnight(self.start),
            base + millis_from_midnight(self.end),
        )
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// One recurring weekly range of an inspector's template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRange {
    pub id: Ulid,
    pub weekday: Weekday,
    pub range: TimeRange,
}

// ── Slots ────────────────────────────────────────────────

/// Deterministic slot id: the timestamp part is the slot start, the random
/// part is the owning inspector's.
pub fn slot_id(inspector_id: Ulid, start: Ms) -> Ulid {
    Ulid::from_parts(start as u64, inspector_id.random())
}

pub fn slot_start(slot_id: Ulid) -> Ms {
    slot_id.timestamp_ms() as Ms
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Free,
    Booked { appointment_id: Ulid },
    Unproductive { reason: String },
}

impl SlotState {
    pub fn label(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Booked { .. } => "booked",
            SlotState::Unproductive { .. } => "unproductive",
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, SlotState::Free)
    }
}

/// A slot materialized for a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub inspector_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub state: SlotState,
}

impl Slot {
    pub fn start_time(&self) -> NaiveTime {
        time_at(self.span.start - day_start(self.date))
    }

    pub fn end_time(&self) -> NaiveTime {
        time_at(self.span.end - day_start(self.date))
    }
}

// ── Appointments ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InspectionKind {
    MoveIn,
    MoveOut,
    Verification,
}

impl InspectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InspectionKind::MoveIn => "move_in",
            InspectionKind::MoveOut => "move_out",
            InspectionKind::Verification => "verification",
        }
    }
}

impl FromStr for InspectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "move_in" | "movein" => Ok(InspectionKind::MoveIn),
            "move_out" | "moveout" => Ok(InspectionKind::MoveOut),
            "verification" => Ok(InspectionKind::Verification),
            other => Err(format!("unknown inspection kind: {other}")),
        }
    }
}

/// What `book` needs besides the ids of the appointment and the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub client_id: Ulid,
    pub agency_id: Ulid,
    pub property_id: Ulid,
    pub kind: InspectionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub inspector_id: Ulid,
    pub span: Span,
    pub client_id: Ulid,
    pub agency_id: Ulid,
    pub property_id: Ulid,
    pub kind: InspectionKind,
    /// Charged to the agency, in cents.
    pub fee_cents: i64,
    /// Owed to the inspector, in cents.
    pub payout_cents: i64,
    pub booked_at: Ms,
}

impl Appointment {
    pub fn date(&self) -> Option<NaiveDate> {
        date_of(self.span.start)
    }
}

// ── Charges ──────────────────────────────────────────────

/// What a client owes for an unproductive visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub inspector_id: Ulid,
    pub date: NaiveDate,
    pub client_id: Ulid,
    pub agency_id: Option<Ulid>,
    pub property_id: Option<Ulid>,
    pub reason: String,
    /// Owed by the client, in cents.
    pub amount_cents: i64,
    /// Owed to the inspector, in cents.
    pub payout_cents: i64,
    pub marked_at: Ms,
    pub paid_at: Option<Ms>,
}

impl Charge {
    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }

    /// Records the charge keeps from being removed while unpaid.
    pub fn refs(&self) -> impl Iterator<Item = Ulid> {
        std::iter::once(self.client_id)
            .chain(self.agency_id)
            .chain(self.property_id)
    }
}

/// Billing details for `mark_unproductive_billed`. The agency defaults to
/// the property's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeRequest {
    pub id: Ulid,
    pub client_id: Ulid,
    pub agency_id: Option<Ulid>,
    pub property_id: Option<Ulid>,
    pub amount_cents: i64,
}

/// Narrows `list_charges`. Every field left `None` matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChargeFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub client_id: Option<Ulid>,
    pub agency_id: Option<Ulid>,
    pub paid: Option<bool>,
}

impl ChargeFilter {
    /// Only what is still owed.
    pub fn unpaid() -> Self {
        Self {
            paid: Some(false),
            ..Self::default()
        }
    }

    pub fn matches(&self, charge: &Charge) -> bool {
        self.from.is_none_or(|from| charge.date >= from)
            && self.to.is_none_or(|to| charge.date <= to)
            && self.client_id.is_none_or(|id| charge.client_id == id)
            && self.agency_id.is_none_or(|id| charge.agency_id == Some(id))
            && self.paid.is_none_or(|paid| charge.is_paid() == paid)
    }
}

/// A stored (non-free) slot state. Free slots are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub slot_id: Ulid,
    pub span: Span,
    pub kind: AllocationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationKind {
    Appointment(Appointment),
    Unproductive { reason: String, marked_at: Ms },
}

impl Allocation {
    pub fn state(&self) -> SlotState {
        match &self.kind {
            AllocationKind::Appointment(a) => SlotState::Booked { appointment_id: a.id },
            AllocationKind::Unproductive { reason, .. } => SlotState::Unproductive {
                reason: reason.clone(),
            },
        }
    }
}

// ── Inspector state ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InspectorState {
    pub id: Ulid,
    pub name: String,
    pub slot_minutes: u32,
    pub template: Vec<TemplateRange>,
    /// Date → explicit ranges. An empty list closes the day.
    pub overrides: BTreeMap<NaiveDate, Vec<TimeRange>>,
    /// Pinned slots, sorted by `span.start`.
    pub allocations: Vec<Allocation>,
}

impl InspectorState {
    pub fn new(id: Ulid, name: String, slot_minutes: u32) -> Self {
        Self {
            id,
            name,
            slot_minutes,
            template: Vec::new(),
            overrides: BTreeMap::new(),
            allocations: Vec::new(),
        }
    }

    pub fn slot_len_ms(&self) -> Ms {
        self.slot_minutes as Ms * 60_000
    }

    /// Ranges in effect on `date`: the override if one is set, else the
    /// template ranges for that weekday.
    pub fn ranges_for(&self, date: NaiveDate) -> Vec<TimeRange> {
        match self.overrides.get(&date) {
            Some(ranges) => ranges.clone(),
            None => {
                let weekday = date.weekday();
                self.template
                    .iter()
                    .filter(|t| t.weekday == weekday)
                    .map(|t| t.range)
                    .collect()
            }
        }
    }

    /// Insert allocation maintaining sort order by span.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, slot_id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.slot_id == slot_id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn allocation(&self, slot_id: Ulid) -> Option<&Allocation> {
        let start = slot_start(slot_id);
        let from = self.allocations.partition_point(|a| a.span.start < start);
        self.allocations[from..]
            .iter()
            .take_while(|a| a.span.start == start)
            .find(|a| a.slot_id == slot_id)
    }

    /// Return only allocations whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    pub fn info(&self) -> InspectorInfo {
        InspectorInfo {
            id: self.id,
            name: self.name.clone(),
            slot_minutes: self.slot_minutes,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    InspectorCreated {
        id: Ulid,
        name: String,
        slot_minutes: u32,
    },
    InspectorUpdated {
        id: Ulid,
        name: String,
        slot_minutes: u32,
    },
    InspectorDeleted {
        id: Ulid,
    },
    TemplateRangeAdded {
        id: Ulid,
        inspector_id: Ulid,
        weekday: Weekday,
        range: TimeRange,
    },
    TemplateRangeRemoved {
        id: Ulid,
        inspector_id: Ulid,
    },
    OverrideSet {
        inspector_id: Ulid,
        date: NaiveDate,
        ranges: Vec<TimeRange>,
    },
    OverrideCleared {
        inspector_id: Ulid,
        date: NaiveDate,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentCancelled {
        id: Ulid,
        inspector_id: Ulid,
        slot_id: Ulid,
    },
    SlotMarkedUnproductive {
        slot_id: Ulid,
        inspector_id: Ulid,
        span: Span,
        reason: String,
        marked_at: Ms,
        charge: Option<Charge>,
    },
    SlotReset {
        slot_id: Ulid,
        inspector_id: Ulid,
    },
    /// Drops pinned slots starting before `before` and overrides dated before it.
    HistoryPurged {
        inspector_id: Ulid,
        before: NaiveDate,
    },
    ClientRegistered(Client),
    ClientRemoved {
        id: Ulid,
    },
    AgencyRegistered(Agency),
    AgencyRemoved {
        id: Ulid,
    },
    PropertyRegistered(Property),
    PropertyRemoved {
        id: Ulid,
    },
    /// A charge carried over by compaction after its slot history is gone.
    ChargeRestored(Charge),
    ChargePaid {
        id: Ulid,
        paid_at: Ms,
    },
}

impl Event {
    /// The inspector an event applies to; `None` for record events and
    /// inspector create/delete, which are handled at the map level.
    pub fn inspector_id(&self) -> Option<Ulid> {
        match self {
            Event::InspectorUpdated { id, .. } => Some(*id),
            Event::TemplateRangeAdded { inspector_id, .. }
            | Event::TemplateRangeRemoved { inspector_id, .. }
            | Event::OverrideSet { inspector_id, .. }
            | Event::OverrideCleared { inspector_id, .. }
            | Event::AppointmentCancelled { inspector_id, .. }
            | Event::SlotMarkedUnproductive { inspector_id, .. }
            | Event::SlotReset { inspector_id, .. }
            | Event::HistoryPurged { inspector_id, .. } => Some(*inspector_id),
            Event::AppointmentBooked { appointment } => Some(appointment.inspector_id),
            Event::InspectorCreated { .. }
            | Event::InspectorDeleted { .. }
            | Event::ClientRegistered(_)
            | Event::ClientRemoved { .. }
            | Event::AgencyRegistered(_)
            | Event::AgencyRemoved { .. }
            | Event::PropertyRegistered(_)
            | Event::PropertyRemoved { .. }
            | Event::ChargeRestored(_)
            | Event::ChargePaid { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorInfo {
    pub id: Ulid,
    pub name: String,
    pub slot_minutes: u32,
}

/// Counts removed by a history purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub appointments: usize,
    pub unproductive: usize,
    pub overrides: usize,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.appointments == 0 && self.unproductive == 0 && self.overrides == 0
    }
}
