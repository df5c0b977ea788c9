use super::*;
use crate::records::{Agency, Client, Furnishing, Property, Rates};
use crate::session::Session;
use chrono::{NaiveTime, Weekday};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn range(from: u32, to: u32) -> TimeRange {
    TimeRange::new(hm(from, 0), hm(to, 0)).unwrap()
}

fn admin() -> Session {
    Session::admin("admin")
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotd_test_ledger");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf) -> Ledger {
    Ledger::open(path.clone(), Arc::new(NotifyHub::new())).unwrap()
}

/// An inspector working Mondays 09:00-12:00 plus a client, an agency and
/// a 60 m² unfurnished property to book against.
struct Fixture {
    ledger: Ledger,
    inspector: Ulid,
    template: Ulid,
    request: BookingRequest,
}

async fn fixture(ledger: Ledger) -> Fixture {
    let s = admin();
    let inspector = Ulid::new();
    let template = Ulid::new();
    ledger.create_inspector(&s, inspector, "Ana", None).await.unwrap();
    ledger
        .add_template_range(&s, template, inspector, Weekday::Mon, range(9, 12))
        .await
        .unwrap();

    let client = Client::new(Ulid::new(), "Rui", "rui@example.com", None).unwrap();
    let agency = Agency::new(
        Ulid::new(),
        "Casa",
        Rates {
            unfurnished: 100,
            semi_furnished: 120,
            furnished: 150,
        },
    )
    .unwrap();
    let property = Property::new(
        Ulid::new(),
        "P-1",
        client.id(),
        agency.id(),
        "Rua Augusta 1",
        60.0,
        Furnishing::Unfurnished,
    )
    .unwrap();
    let request = BookingRequest {
        client_id: client.id(),
        agency_id: agency.id(),
        property_id: property.id(),
        kind: InspectionKind::MoveIn,
    };
    ledger.register_client(&s, client).await.unwrap();
    ledger.register_agency(&s, agency).await.unwrap();
    ledger.register_property(&s, property).await.unwrap();

    Fixture {
        ledger,
        inspector,
        template,
        request,
    }
}

async fn slots_on(f: &Fixture, d: NaiveDate) -> Vec<Slot> {
    f.ledger.list_slots(&admin(), f.inspector, d, d).await.unwrap()
}

// ── Slots & overrides ────────────────────────────────────

#[tokio::test]
async fn template_produces_hourly_slots() {
    let path = test_wal_path("template_slots.wal");
    let f = fixture(open(&path)).await;

    let slots = slots_on(&f, date(2025, 1, 6)).await;
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|s| s.state.is_free()));
    assert_eq!(slots[0].start_time(), hm(9, 0));
    assert_eq!(slots[2].end_time(), hm(12, 0));

    // Tuesday has no template range.
    assert!(slots_on(&f, date(2025, 1, 7)).await.is_empty());
}

#[tokio::test]
async fn override_then_book_first_slot() {
    let path = test_wal_path("override_book.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let monday = date(2025, 1, 6);

    f.ledger
        .set_override(&s, f.inspector, monday, vec![range(11, 12), range(9, 10)])
        .await
        .unwrap();
    let slots = slots_on(&f, monday).await;
    let times: Vec<_> = slots.iter().map(|s| (s.start_time(), s.end_time())).collect();
    assert_eq!(times, vec![(hm(9, 0), hm(10, 0)), (hm(11, 0), hm(12, 0))]);

    let appt = f
        .ledger
        .book(&s, Ulid::new(), slots[0].id, f.request)
        .await
        .unwrap();
    assert_eq!(appt.inspector_id, f.inspector);
    assert_eq!(appt.date(), Some(monday));
    // 60 m² unfurnished at 100 cents per m².
    assert_eq!(appt.fee_cents, 6000);
    assert_eq!(appt.payout_cents, 6000);

    let slots = slots_on(&f, monday).await;
    assert_eq!(
        slots[0].state,
        SlotState::Booked {
            appointment_id: appt.id
        }
    );
    assert!(slots[1].state.is_free());
}

#[tokio::test]
async fn overlapping_override_rejected() {
    let path = test_wal_path("override_overlap.wal");
    let f = fixture(open(&path)).await;

    let err = f
        .ledger
        .set_override(&admin(), f.inspector, date(2025, 1, 6), vec![range(9, 11), range(10, 12)])
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRange(_)));
}

#[tokio::test]
async fn empty_override_closes_day_and_clear_restores() {
    let path = test_wal_path("override_close.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let monday = date(2025, 1, 6);

    f.ledger.set_override(&s, f.inspector, monday, vec![]).await.unwrap();
    assert!(slots_on(&f, monday).await.is_empty());

    assert!(f.ledger.clear_override(&s, f.inspector, monday).await.unwrap());
    assert_eq!(slots_on(&f, monday).await.len(), 3);
    assert!(!f.ledger.clear_override(&s, f.inspector, monday).await.unwrap());
}

#[tokio::test]
async fn inverted_window_rejected() {
    let path = test_wal_path("inverted_window.wal");
    let f = fixture(open(&path)).await;

    let err = f
        .ledger
        .list_slots(&admin(), f.inspector, date(2025, 1, 7), date(2025, 1, 6))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRange(_)));
}

#[tokio::test]
async fn pinned_slot_survives_template_removal() {
    let path = test_wal_path("pinned_survives.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let monday = date(2025, 1, 6);

    let slot = slots_on(&f, monday).await[1].clone();
    f.ledger.mark_unproductive(&s, slot.id, "flooded").await.unwrap();

    f.ledger.remove_template_range(&s, f.template).await.unwrap();
    let slots = slots_on(&f, monday).await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].id, slot.id);
    assert_eq!(slots[0].state.label(), "unproductive");
}

// ── Booking & cancellation ───────────────────────────────

#[tokio::test]
async fn double_booking_rejected() {
    let path = test_wal_path("double_book.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;

    f.ledger.book(&s, Ulid::new(), slot, f.request).await.unwrap();
    let err = f
        .ledger
        .book(&s, Ulid::new(), slot, f.request)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::SlotUnavailable { state: "booked", .. }
    ));
}

#[tokio::test]
async fn concurrent_bookings_exactly_one_wins() {
    let path = test_wal_path("concurrent_book.wal");
    let f = Arc::new(fixture(open(&path)).await);
    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            f.ledger.book(&admin(), Ulid::new(), slot, f.request).await
        }));
    }
    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert!(matches!(e, LedgerError::SlotUnavailable { .. })),
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test]
async fn concurrent_bookings_with_same_id_one_wins() {
    let path = test_wal_path("concurrent_same_id.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slots = slots_on(&f, date(2025, 1, 6)).await;
    let id = Ulid::new();

    let (a, b) = tokio::join!(
        f.ledger.book(&s, id, slots[0].id, f.request),
        f.ledger.book(&s, id, slots[1].id, f.request),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::AlreadyExists(dup)) if *dup == id)));

    let booked = slots_on(&f, date(2025, 1, 6))
        .await
        .iter()
        .filter(|slot| !slot.state.is_free())
        .count();
    assert_eq!(booked, 1);

    f.ledger.cancel(&s, id).await.unwrap();
    assert!(slots_on(&f, date(2025, 1, 6))
        .await
        .iter()
        .all(|slot| slot.state.is_free()));
    // The id is free to reuse once cancelled.
    f.ledger.book(&s, id, slots[2].id, f.request).await.unwrap();
}

#[tokio::test]
async fn cancel_frees_slot() {
    let path = test_wal_path("cancel.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;

    let appt = f.ledger.book(&s, Ulid::new(), slot, f.request).await.unwrap();
    assert_eq!(f.ledger.get_appointment(&s, appt.id).await.unwrap(), appt);

    f.ledger.cancel(&s, appt.id).await.unwrap();
    assert!(slots_on(&f, date(2025, 1, 6)).await[0].state.is_free());
    assert!(matches!(
        f.ledger.get_appointment(&s, appt.id).await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(
        f.ledger.cancel(&s, appt.id).await,
        Err(LedgerError::NotFound(_))
    ));
    // Rebookable.
    f.ledger.book(&s, Ulid::new(), slot, f.request).await.unwrap();
}

#[tokio::test]
async fn unknown_slot_not_found() {
    let path = test_wal_path("unknown_slot.wal");
    let f = fixture(open(&path)).await;
    let s = admin();

    // Right inspector, but Tuesday has no slots.
    let tuesday = day_start(date(2025, 1, 7)) + 9 * 3_600_000;
    let bogus = slot_id(f.inspector, tuesday);
    assert!(matches!(
        f.ledger.book(&s, Ulid::new(), bogus, f.request).await,
        Err(LedgerError::NotFound(_))
    ));
    // No such inspector at all.
    assert!(matches!(
        f.ledger.book(&s, Ulid::new(), Ulid::new(), f.request).await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test]
async fn booking_checks_records() {
    let path = test_wal_path("book_records.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;

    let mut request = f.request;
    request.client_id = Ulid::new();
    assert!(matches!(
        f.ledger.book(&s, Ulid::new(), slot, request).await,
        Err(LedgerError::NotFound(_))
    ));

    let other = Client::new(Ulid::new(), "Eva", "eva@example.com", None).unwrap();
    let mut request = f.request;
    request.client_id = other.id();
    f.ledger.register_client(&s, other).await.unwrap();
    assert!(matches!(
        f.ledger.book(&s, Ulid::new(), slot, request).await,
        Err(LedgerError::Validation(_))
    ));
}

// ── Unproductive ─────────────────────────────────────────

#[tokio::test]
async fn unproductive_transitions() {
    let path = test_wal_path("unproductive.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slots = slots_on(&f, date(2025, 1, 6)).await;
    let (booked, idle) = (slots[0].id, slots[1].id);

    f.ledger.book(&s, Ulid::new(), booked, f.request).await.unwrap();
    assert!(matches!(
        f.ledger.mark_unproductive(&s, booked, "late").await,
        Err(LedgerError::SlotUnavailable { state: "booked", .. })
    ));

    f.ledger.mark_unproductive(&s, idle, "no keys").await.unwrap();
    assert!(matches!(
        f.ledger.book(&s, Ulid::new(), idle, f.request).await,
        Err(LedgerError::SlotUnavailable {
            state: "unproductive",
            ..
        })
    ));
    assert!(matches!(
        f.ledger.mark_unproductive(&s, idle, "again").await,
        Err(LedgerError::SlotUnavailable { .. })
    ));
    assert!(matches!(
        f.ledger.mark_unproductive(&s, slots[2].id, "   ").await,
        Err(LedgerError::Validation(_))
    ));

    f.ledger.reset_slot(&s, idle).await.unwrap();
    f.ledger.book(&s, Ulid::new(), idle, f.request).await.unwrap();

    assert!(matches!(
        f.ledger.reset_slot(&s, booked).await,
        Err(LedgerError::SlotUnavailable { state: "booked", .. })
    ));
    // Free and derivable: nothing to do.
    f.ledger.reset_slot(&s, slots[2].id).await.unwrap();
}

// ── Billing ──────────────────────────────────────────────

fn charge_for(f: &Fixture, amount_cents: i64) -> ChargeRequest {
    ChargeRequest {
        id: Ulid::new(),
        client_id: f.request.client_id,
        agency_id: None,
        property_id: Some(f.request.property_id),
        amount_cents,
    }
}

#[tokio::test]
async fn billed_unproductive_visit() {
    let path = test_wal_path("billed.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let monday = date(2025, 1, 6);
    let slots = slots_on(&f, monday).await;
    let client_id = f.request.client_id;

    let request = charge_for(&f, 8_000);
    let charge = f
        .ledger
        .mark_unproductive_billed(&s, slots[0].id, "no keys", request)
        .await
        .unwrap();
    assert_eq!(charge.id, request.id);
    assert_eq!(charge.payout_cents, 2_400);
    assert_eq!(charge.inspector_id, f.inspector);
    assert_eq!(charge.date, monday);
    // Billed to the property's agency when none is named.
    assert_eq!(charge.agency_id, Some(f.request.agency_id));
    assert!(!charge.is_paid());
    assert_eq!(f.ledger.client_balance(&s, client_id).unwrap(), 8_000);
    assert!(matches!(
        slots_on(&f, monday).await[0].state,
        SlotState::Unproductive { .. }
    ));

    assert!(matches!(
        f.ledger
            .mark_unproductive_billed(&s, slots[1].id, "again", request)
            .await,
        Err(LedgerError::AlreadyExists(_))
    ));
    assert!(matches!(
        f.ledger
            .mark_unproductive_billed(&s, slots[1].id, "free", charge_for(&f, 0))
            .await,
        Err(LedgerError::Validation(_))
    ));
    let foreign = ChargeRequest {
        agency_id: Some(Ulid::new()),
        ..charge_for(&f, 100)
    };
    assert!(matches!(
        f.ledger
            .mark_unproductive_billed(&s, slots[1].id, "x", foreign)
            .await,
        Err(LedgerError::NotFound(_))
    ));
    // Rejected charges leave the slot free.
    assert!(slots_on(&f, monday).await[1].state.is_free());

    let me = Session::inspector(f.inspector);
    assert!(matches!(
        f.ledger
            .mark_unproductive_billed(&me, slots[1].id, "x", charge_for(&f, 100))
            .await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        f.ledger.list_charges(&me, &ChargeFilter::default()),
        Err(LedgerError::Forbidden(_))
    ));

    // An unpaid charge pins the client.
    assert!(matches!(
        f.ledger.remove_client(&s, client_id).await,
        Err(LedgerError::InUse(_))
    ));
    let unpaid = ChargeFilter {
        agency_id: Some(f.request.agency_id),
        ..ChargeFilter::unpaid()
    };
    assert_eq!(f.ledger.list_charges(&s, &unpaid).unwrap(), vec![charge.clone()]);

    assert!(f.ledger.pay_charge(&s, charge.id).await.unwrap());
    assert!(!f.ledger.pay_charge(&s, charge.id).await.unwrap());
    assert!(matches!(
        f.ledger.pay_charge(&s, Ulid::new()).await,
        Err(LedgerError::NotFound(_))
    ));
    assert_eq!(f.ledger.client_balance(&s, client_id).unwrap(), 0);
    assert!(f.ledger.list_charges(&s, &unpaid).unwrap().is_empty());
    let paid = f
        .ledger
        .list_charges(
            &s,
            &ChargeFilter {
                paid: Some(true),
                ..ChargeFilter::default()
            },
        )
        .unwrap();
    assert_eq!(paid.len(), 1);
    assert!(paid[0].is_paid());
    assert_eq!(f.ledger.records().ref_count(&client_id), 0);
}

#[tokio::test]
async fn reset_voids_unpaid_charge() {
    let path = test_wal_path("billed_reset.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slots = slots_on(&f, date(2025, 1, 6)).await;

    let voided = f
        .ledger
        .mark_unproductive_billed(&s, slots[0].id, "no keys", charge_for(&f, 5_000))
        .await
        .unwrap();
    f.ledger.reset_slot(&s, slots[0].id).await.unwrap();
    assert!(f.ledger.records().charge(&voided.id).is_none());
    assert_eq!(f.ledger.client_balance(&s, f.request.client_id).unwrap(), 0);

    // A settled charge outlives the reset.
    let settled = f
        .ledger
        .mark_unproductive_billed(&s, slots[1].id, "no keys", charge_for(&f, 5_000))
        .await
        .unwrap();
    f.ledger.pay_charge(&s, settled.id).await.unwrap();
    f.ledger.reset_slot(&s, slots[1].id).await.unwrap();
    assert!(f.ledger.records().charge(&settled.id).is_some_and(|c| c.is_paid()));
}

#[tokio::test]
async fn charges_survive_replay_and_compaction() {
    let path = test_wal_path("billed_replay.wal");
    let s = admin();
    let (client_id, unpaid, paid) = {
        let f = fixture(open(&path)).await;
        let slots = slots_on(&f, date(2025, 1, 6)).await;
        let unpaid = f
            .ledger
            .mark_unproductive_billed(&s, slots[0].id, "no keys", charge_for(&f, 4_000))
            .await
            .unwrap();
        let paid = f
            .ledger
            .mark_unproductive_billed(&s, slots[1].id, "tenant absent", charge_for(&f, 6_000))
            .await
            .unwrap();
        f.ledger.pay_charge(&s, paid.id).await.unwrap();
        (f.request.client_id, unpaid, f.ledger.records().charge(&paid.id).unwrap())
    };

    let ledger = open(&path);
    assert_eq!(ledger.records().charge(&unpaid.id), Some(unpaid.clone()));
    assert_eq!(ledger.records().charge(&paid.id), Some(paid.clone()));
    assert_eq!(ledger.client_balance(&s, client_id).unwrap(), 4_000);

    ledger.compact_wal().await.unwrap();
    drop(ledger);
    let ledger = open(&path);
    let all = ledger.list_charges(&s, &ChargeFilter::default()).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&unpaid) && all.contains(&paid));
    assert_eq!(ledger.records().ref_count(&client_id), 1);
}

#[tokio::test]
async fn appointments_filter_by_agency() {
    let path = test_wal_path("agency_filter.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let monday = date(2025, 1, 6);
    let slot = slots_on(&f, monday).await[0].id;
    f.ledger.book(&s, Ulid::new(), slot, f.request).await.unwrap();

    let agency = Some(f.request.agency_id);
    let billed = f
        .ledger
        .list_appointments(&s, None, agency, monday, monday)
        .await
        .unwrap();
    assert_eq!(billed.len(), 1);
    let other = f
        .ledger
        .list_appointments(&s, Some(f.inspector), Some(Ulid::new()), monday, monday)
        .await
        .unwrap();
    assert!(other.is_empty());
}

// ── Sessions ─────────────────────────────────────────────

#[tokio::test]
async fn inspector_sessions_are_scoped() {
    let path = test_wal_path("sessions.wal");
    let f = fixture(open(&path)).await;
    let me = Session::inspector(f.inspector);
    let stranger = Session::inspector(Ulid::new());
    let monday = date(2025, 1, 6);

    let slots = f.ledger.list_slots(&me, f.inspector, monday, monday).await.unwrap();
    assert!(matches!(
        f.ledger.list_slots(&stranger, f.inspector, monday, monday).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        f.ledger.book(&me, Ulid::new(), slots[0].id, f.request).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        f.ledger.create_inspector(&me, Ulid::new(), "Bo", None).await,
        Err(LedgerError::Forbidden(_))
    ));
    assert!(matches!(
        f.ledger.mark_unproductive(&stranger, slots[0].id, "x").await,
        Err(LedgerError::Forbidden(_))
    ));
    // Same answer whether or not the slot's owner exists.
    let ownerless = slot_id(Ulid::new(), slots[0].span.start);
    assert!(matches!(
        f.ledger.mark_unproductive(&stranger, ownerless, "x").await,
        Err(LedgerError::Forbidden(_))
    ));
    f.ledger.mark_unproductive(&me, slots[0].id, "sick").await.unwrap();

    // Without a filter an inspector only sees its own appointments.
    f.ledger
        .book(&admin(), Ulid::new(), slots[1].id, f.request)
        .await
        .unwrap();
    let mine = f.ledger.list_appointments(&me, None, None, monday, monday).await.unwrap();
    assert_eq!(mine.len(), 1);
    let theirs = f
        .ledger
        .list_appointments(&stranger, None, None, monday, monday)
        .await
        .unwrap();
    assert!(theirs.is_empty());
}

// ── Inspectors & records ─────────────────────────────────

#[tokio::test]
async fn inspector_lifecycle() {
    let path = test_wal_path("inspector_lifecycle.wal");
    let f = fixture(open(&path)).await;
    let s = admin();

    assert!(matches!(
        f.ledger.create_inspector(&s, f.inspector, "Dup", None).await,
        Err(LedgerError::AlreadyExists(_))
    ));
    assert!(matches!(
        f.ledger.create_inspector(&s, Ulid::new(), "Bo", Some(3)).await,
        Err(LedgerError::Validation(_) | LedgerError::LimitExceeded(_))
    ));

    f.ledger.update_inspector(&s, f.inspector, "Ana Lima", 30).await.unwrap();
    assert_eq!(slots_on(&f, date(2025, 1, 6)).await.len(), 6);
    let info = f.ledger.list_inspectors().await;
    assert_eq!(info[0].name, "Ana Lima");

    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;
    let appt = f.ledger.book(&s, Ulid::new(), slot, f.request).await.unwrap();
    assert!(matches!(
        f.ledger.delete_inspector(&s, f.inspector).await,
        Err(LedgerError::InUse(_))
    ));
    f.ledger.cancel(&s, appt.id).await.unwrap();
    f.ledger.delete_inspector(&s, f.inspector).await.unwrap();
    assert!(f.ledger.list_inspectors().await.is_empty());
    assert!(matches!(
        f.ledger.book(&s, Ulid::new(), slot, f.request).await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test]
async fn referenced_records_cannot_be_removed() {
    let path = test_wal_path("records_in_use.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;

    let appt = f.ledger.book(&s, Ulid::new(), slot, f.request).await.unwrap();
    assert_eq!(f.ledger.records().ref_count(&f.request.property_id), 1);
    assert!(matches!(
        f.ledger.remove_property(&s, f.request.property_id).await,
        Err(LedgerError::InUse(_))
    ));
    assert!(matches!(
        f.ledger.remove_client(&s, f.request.client_id).await,
        Err(LedgerError::InUse(_))
    ));

    f.ledger.cancel(&s, appt.id).await.unwrap();
    f.ledger.remove_property(&s, f.request.property_id).await.unwrap();
    f.ledger.remove_client(&s, f.request.client_id).await.unwrap();
    f.ledger.remove_agency(&s, f.request.agency_id).await.unwrap();
    assert!(f.ledger.records().is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let s = admin();
    let monday = date(2025, 1, 6);
    let (inspector, appt, slots) = {
        let f = fixture(open(&path)).await;
        f.ledger
            .set_override(&s, f.inspector, monday, vec![range(9, 10), range(11, 12)])
            .await
            .unwrap();
        let slots = slots_on(&f, monday).await;
        let appt = f
            .ledger
            .book(&s, Ulid::new(), slots[0].id, f.request)
            .await
            .unwrap();
        f.ledger.mark_unproductive(&s, slots[1].id, "storm").await.unwrap();
        let slots = slots_on(&f, monday).await;
        (f.inspector, appt, slots)
    };

    let ledger = open(&path);
    assert_eq!(ledger.list_slots(&s, inspector, monday, monday).await.unwrap(), slots);
    assert_eq!(ledger.get_appointment(&s, appt.id).await.unwrap(), appt);
    assert_eq!(ledger.records().ref_count(&appt.client_id), 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let s = admin();
    let monday = date(2025, 1, 6);
    let (inspector, slots) = {
        let f = fixture(open(&path)).await;
        let first = slots_on(&f, monday).await[0].id;
        for _ in 0..5 {
            let appt = f.ledger.book(&s, Ulid::new(), first, f.request).await.unwrap();
            f.ledger.cancel(&s, appt.id).await.unwrap();
        }
        f.ledger.book(&s, Ulid::new(), first, f.request).await.unwrap();
        assert!(f.ledger.wal_appends_since_compact().await > 0);

        let before = std::fs::metadata(&path).unwrap().len();
        f.ledger.compact_wal().await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        assert_eq!(f.ledger.wal_appends_since_compact().await, 0);
        (f.inspector, slots_on(&f, monday).await)
    };

    let ledger = open(&path);
    assert_eq!(ledger.list_slots(&s, inspector, monday, monday).await.unwrap(), slots);
}

#[tokio::test]
async fn purge_drops_old_history() {
    let path = test_wal_path("purge.wal");
    let f = fixture(open(&path)).await;
    let s = admin();
    let (old, new) = (date(2025, 1, 6), date(2025, 1, 13));

    let old_slots = slots_on(&f, old).await;
    let appt = f
        .ledger
        .book(&s, Ulid::new(), old_slots[0].id, f.request)
        .await
        .unwrap();
    f.ledger.mark_unproductive(&s, old_slots[1].id, "rain").await.unwrap();
    f.ledger.set_override(&s, f.inspector, old, vec![range(9, 12)]).await.unwrap();
    let kept = f
        .ledger
        .book(&s, Ulid::new(), slots_on(&f, new).await[0].id, f.request)
        .await
        .unwrap();

    let report = f.ledger.purge_history(date(2025, 1, 10)).await.unwrap();
    assert_eq!(
        report,
        PurgeReport {
            appointments: 1,
            unproductive: 1,
            overrides: 1
        }
    );
    assert!(matches!(
        f.ledger.get_appointment(&s, appt.id).await,
        Err(LedgerError::NotFound(_))
    ));
    assert_eq!(f.ledger.get_appointment(&s, kept.id).await.unwrap(), kept);
    assert_eq!(f.ledger.records().ref_count(&f.request.property_id), 1);

    assert!(f.ledger.purge_history(date(2025, 1, 10)).await.unwrap().is_empty());
}

#[tokio::test]
async fn subscribers_see_bookings() {
    let path = test_wal_path("notify.wal");
    let f = fixture(open(&path)).await;
    let mut rx = f.ledger.notify.subscribe(f.inspector);
    let slot = slots_on(&f, date(2025, 1, 6)).await[0].id;

    let appt = f
        .ledger
        .book(&admin(), Ulid::new(), slot, f.request)
        .await
        .unwrap();
    let n = rx.recv().await.unwrap();
    assert_eq!(n.event, Event::AppointmentBooked { appointment: appt });
}
