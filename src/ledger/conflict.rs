use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::LedgerError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), LedgerError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(LedgerError::LimitExceeded("date out of range"));
    }
    Ok(())
}

/// Inclusive `[from, to]` date window, at most `max_days` long.
pub(crate) fn validate_window(from: NaiveDate, to: NaiveDate, max_days: i64) -> Result<(), LedgerError> {
    validate_date(from)?;
    validate_date(to)?;
    if to < from {
        return Err(LedgerError::InvalidRange(format!("{to} is before {from}")));
    }
    if (to - from).num_days() + 1 > max_days {
        return Err(LedgerError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Sort `ranges` and reject any pair that overlaps. Touching is fine.
pub(crate) fn check_disjoint(ranges: &mut [TimeRange]) -> Result<(), LedgerError> {
    ranges.sort();
    for pair in ranges.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(LedgerError::InvalidRange(format!(
                "{} overlaps {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// The check half of every check-and-set on a slot.
pub(crate) fn check_free(slot: &Slot) -> Result<(), LedgerError> {
    if slot.state.is_free() {
        Ok(())
    } else {
        Err(LedgerError::SlotUnavailable {
            slot: slot.id,
            state: slot.state.label(),
        })
    }
}

pub(crate) fn validate_slot_minutes(minutes: u32) -> Result<(), LedgerError> {
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&minutes) {
        return Err(LedgerError::LimitExceeded("slot length out of range"));
    }
    Ok(())
}

pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<String, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(LedgerError::LimitExceeded(field));
    }
    Ok(value.to_string())
}
