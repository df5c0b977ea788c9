use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Slot derivation ──────────────────────────────────────────────

/// Materialize an inspector's slots for one date.
///
/// 1. Take the override for the date, or the template ranges for its weekday.
/// 2. Sort and merge overlapping/adjacent ranges.
/// 3. Cut each merged range into `slot_minutes` pieces; a trailing remainder
///    shorter than one slot is not offered.
/// 4. Overlay pinned (booked / unproductive) slots of that date. A derived
///    free slot overlapping a pinned one is dropped.
pub fn materialize(inspector: &InspectorState, date: NaiveDate) -> Vec<Slot> {
    let mut ranges: Vec<Span> = inspector
        .ranges_for(date)
        .iter()
        .map(|r| r.on(date))
        .collect();
    ranges.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&ranges);
    let derived = split_into_slots(&merged, inspector.slot_len_ms());

    let day = Span::of_day(date);
    let pinned: Vec<&Allocation> = inspector
        .overlapping(&day)
        .filter(|a| a.span.start >= day.start)
        .collect();

    let mut slots: Vec<Slot> = pinned
        .iter()
        .map(|a| Slot {
            id: a.slot_id,
            inspector_id: inspector.id,
            date,
            span: a.span,
            state: a.state(),
        })
        .collect();

    for span in derived {
        if pinned.iter().any(|a| a.span.overlaps(&span)) {
            continue;
        }
        slots.push(Slot {
            id: slot_id(inspector.id, span.start),
            inspector_id: inspector.id,
            date,
            span,
            state: SlotState::Free,
        });
    }

    slots.sort_by_key(|s| s.span.start);
    slots
}

/// Re-derive a single slot from its id. `None` if the id does not name a slot
/// the inspector currently has.
pub fn find_slot(inspector: &InspectorState, id: Ulid) -> Option<Slot> {
    if id.random() != inspector.id.random() {
        return None;
    }
    let date = date_of(slot_start(id))?;
    materialize(inspector, date).into_iter().find(|s| s.id == id)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Cut disjoint ranges into consecutive `slot_len` pieces.
pub fn split_into_slots(ranges: &[Span], slot_len: Ms) -> Vec<Span> {
    if slot_len <= 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for range in ranges {
        let mut start = range.start;
        while start + slot_len <= range.end {
            out.push(Span::new(start, start + slot_len));
            start += slot_len;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn range(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeRange {
        TimeRange::new(t(h1, m1), t(h2, m2)).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
    }

    fn inspector_with(slot_minutes: u32, template: &[(Weekday, TimeRange)]) -> InspectorState {
        let mut st = InspectorState::new(Ulid::new(), "Ana".into(), slot_minutes);
        for &(weekday, range) in template {
            st.template.push(TemplateRange {
                id: Ulid::new(),
                weekday,
                range,
            });
        }
        st
    }

    fn starts(slots: &[Slot]) -> Vec<NaiveTime> {
        slots.iter().map(Slot::start_time).collect()
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(0, 100), Span::new(50, 150), Span::new(300, 400)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(0, 150), Span::new(300, 400)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(0, 100), Span::new(100, 200)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 200)]);
    }

    #[test]
    fn merge_overlapping_duplicates() {
        let spans = vec![Span::new(0, 100), Span::new(0, 100), Span::new(20, 80)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 100)]);
    }

    #[test]
    fn split_drops_short_remainder() {
        let pieces = split_into_slots(&[Span::new(0, 150 * M)], H);
        assert_eq!(pieces, vec![Span::new(0, H), Span::new(H, 2 * H)]);
    }

    #[test]
    fn split_shorter_than_slot_yields_nothing() {
        assert!(split_into_slots(&[Span::new(0, 30 * M)], H).is_empty());
    }

    #[test]
    fn template_produces_hourly_slots() {
        let st = inspector_with(60, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        let slots = materialize(&st, monday());
        assert_eq!(starts(&slots), vec![t(9, 0), t(10, 0), t(11, 0)]);
        assert!(slots.iter().all(|s| s.state.is_free()));
        assert!(slots.iter().all(|s| s.inspector_id == st.id));
    }

    #[test]
    fn other_weekday_is_empty() {
        let st = inspector_with(60, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        let tuesday = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        assert!(materialize(&st, tuesday).is_empty());
    }

    #[test]
    fn override_replaces_template() {
        let mut st = inspector_with(60, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        st.overrides
            .insert(monday(), vec![range(9, 0, 10, 0), range(11, 0, 12, 0)]);
        let slots = materialize(&st, monday());
        assert_eq!(starts(&slots), vec![t(9, 0), t(11, 0)]);
    }

    #[test]
    fn empty_override_closes_day() {
        let mut st = inspector_with(60, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        st.overrides.insert(monday(), vec![]);
        assert!(materialize(&st, monday()).is_empty());
    }

    #[test]
    fn overlapping_template_ranges_are_deduplicated() {
        let st = inspector_with(
            60,
            &[
                (Weekday::Mon, range(9, 0, 11, 0)),
                (Weekday::Mon, range(10, 0, 12, 0)),
                (Weekday::Mon, range(9, 0, 11, 0)),
            ],
        );
        let slots = materialize(&st, monday());
        assert_eq!(starts(&slots), vec![t(9, 0), t(10, 0), t(11, 0)]);
    }

    #[test]
    fn slots_never_overlap() {
        let st = inspector_with(
            45,
            &[
                (Weekday::Mon, range(8, 0, 10, 30)),
                (Weekday::Mon, range(10, 0, 13, 15)),
                (Weekday::Mon, range(14, 0, 15, 0)),
            ],
        );
        let slots = materialize(&st, monday());
        assert!(!slots.is_empty());
        for pair in slots.windows(2) {
            assert!(pair[0].span.end <= pair[1].span.start);
        }
        assert!(slots.iter().all(|s| s.span.duration_ms() == 45 * M));
    }

    #[test]
    fn pinned_slot_survives_template_change() {
        let mut st = inspector_with(60, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        let span = range(10, 0, 11, 0).on(monday());
        st.insert_allocation(Allocation {
            slot_id: slot_id(st.id, span.start),
            span,
            kind: AllocationKind::Unproductive {
                reason: "tenant absent".into(),
                marked_at: 0,
            },
        });

        st.overrides.insert(monday(), vec![]);
        let slots = materialize(&st, monday());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].state.label(), "unproductive");
        assert_eq!(slots[0].start_time(), t(10, 0));
    }

    #[test]
    fn pinned_slot_suppresses_overlapping_free_slot() {
        // Slot length shortened to 30 after 10:00-11:00 was pinned.
        let mut st = inspector_with(30, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        let span = range(10, 0, 11, 0).on(monday());
        st.insert_allocation(Allocation {
            slot_id: slot_id(st.id, span.start),
            span,
            kind: AllocationKind::Unproductive {
                reason: "rain".into(),
                marked_at: 0,
            },
        });
        let slots = materialize(&st, monday());
        assert_eq!(
            starts(&slots),
            vec![t(9, 0), t(9, 30), t(10, 0), t(11, 0), t(11, 30)]
        );
        assert_eq!(slots[2].span.duration_ms(), H);
    }

    #[test]
    fn find_slot_by_id() {
        let st = inspector_with(60, &[(Weekday::Mon, range(9, 0, 12, 0))]);
        let nine = range(9, 0, 10, 0).on(monday());
        let found = find_slot(&st, slot_id(st.id, nine.start)).unwrap();
        assert_eq!(found.span, nine);

        // Not on a slot boundary.
        assert!(find_slot(&st, slot_id(st.id, nine.start + 30 * M)).is_none());
        // Another inspector's id space.
        assert!(find_slot(&st, slot_id(Ulid::new(), nine.start)).is_none());
    }
}
