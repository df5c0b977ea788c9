//! Inspection pricing, in integer cents.
//!
//! The fee charged to the agency scales with the agency's per-m² rate for the
//! property's furnishing. The inspector payout follows a fixed size table.
//! Verification inspections are billed and paid at half price. An
//! unproductive visit pays the inspector 30% of what the client is charged.

use crate::model::InspectionKind;
use crate::records::{Agency, Furnishing, Property};

const UNPRODUCTIVE_SHARE: f64 = 0.30;

fn per_m2(size_m2: f64, cents: i64) -> i64 {
    (size_m2 * cents as f64).round() as i64
}

fn apply_kind(cents: i64, kind: InspectionKind) -> i64 {
    match kind {
        InspectionKind::Verification => (cents as f64 * 0.5).round() as i64,
        InspectionKind::MoveIn | InspectionKind::MoveOut => cents,
    }
}

/// Amount charged to the agency for inspecting `property`.
pub fn inspection_fee(property: &Property, agency: &Agency, kind: InspectionKind) -> i64 {
    let rate = agency.rates().rate_for(property.furnishing());
    apply_kind(per_m2(property.size_m2(), rate), kind)
}

/// Amount owed to the inspector for inspecting `property`.
pub fn inspector_payout(property: &Property, kind: InspectionKind) -> i64 {
    let size = property.size_m2();
    let base = match property.furnishing() {
        Furnishing::Furnished => {
            if size < 50.0 {
                6_500
            } else if size < 100.0 {
                per_m2(size, 125)
            } else if size <= 140.0 {
                12_500
            } else {
                per_m2(size, 90)
            }
        }
        Furnishing::Unfurnished | Furnishing::SemiFurnished => {
            if size < 50.0 {
                5_000
            } else if size < 100.0 {
                per_m2(size, 100)
            } else if size <= 135.0 {
                10_000
            } else {
                per_m2(size, 75)
            }
        }
    };
    apply_kind(base, kind)
}

/// Inspector's share of what the client is charged for an unproductive
/// visit.
pub fn unproductive_payout(charge_cents: i64) -> i64 {
    (charge_cents as f64 * UNPRODUCTIVE_SHARE).round() as i64
}
