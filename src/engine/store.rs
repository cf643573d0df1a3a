use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Where a reservation lives and who owns it. Neither changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationKey {
    pub space_id: Ulid,
    pub user_id: Ulid,
}

/// Secondary indexes over reservations plus the check-in audit trail.
/// Reservation records themselves live in their space's schedule.
pub struct ReservationStore {
    by_id: DashMap<Ulid, ReservationKey>,
    by_user: DashMap<Ulid, Vec<Ulid>>,
    /// Keyed by reservation id; at most one check-in per reservation.
    check_ins: DashMap<Ulid, CheckInRecord>,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            check_ins: DashMap::new(),
        }
    }

    // ── Reservation index ────────────────────────────────────

    pub fn key(&self, id: &Ulid) -> Option<ReservationKey> {
        self.by_id.get(id).map(|e| *e.value())
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids_for_user(&self, user_id: &Ulid) -> Vec<Ulid> {
        self.by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn map_reservation(&self, id: Ulid, key: ReservationKey) {
        if self.by_id.insert(id, key).is_none() {
            self.by_user.entry(key.user_id).or_default().push(id);
        }
    }

    // ── Check-in audit trail ─────────────────────────────────

    pub fn check_in(&self, reservation_id: &Ulid) -> Option<CheckInRecord> {
        self.check_ins.get(reservation_id).map(|e| e.value().clone())
    }

    pub fn check_in_records(&self) -> Vec<CheckInRecord> {
        self.check_ins.iter().map(|e| e.value().clone()).collect()
    }

    fn record_check_in(&self, record: CheckInRecord) {
        // Audit entries are never overwritten.
        self.check_ins.entry(record.reservation_id).or_insert(record);
    }

    // ── Event application ────────────────────────────────────

    /// The user whose ledger a reservation event touches.
    pub fn owner_of(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::ReservationCreated { reservation } => Some(reservation.user_id),
            Event::CheckInRecorded { record } => Some(record.user_id),
            Event::ReservationUpdated { id, .. }
            | Event::ReservationCheckedIn { id, .. }
            | Event::ReservationCheckedOut { id, .. }
            | Event::ReservationCancelled { id, .. } => self.key(id).map(|k| k.user_id),
            _ => None,
        }
    }

    /// Apply a reservation event. The caller holds both the schedule and
    /// the ledger the event belongs to.
    pub fn apply_event(&self, schedule: &mut SpaceSchedule, ledger: &mut UserLedger, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                if reservation.is_active() {
                    ledger.insert(LedgerEntry {
                        reservation_id: reservation.id,
                        space_id: reservation.space_id,
                        span: reservation.span,
                    });
                }
                self.map_reservation(
                    reservation.id,
                    ReservationKey {
                        space_id: reservation.space_id,
                        user_id: reservation.user_id,
                    },
                );
                schedule.remove(reservation.id);
                schedule.insert(reservation.clone());
            }
            Event::ReservationUpdated {
                id,
                span,
                title,
                description,
                attendees_count,
                by,
                at,
                ..
            } => {
                if let Some(mut r) = schedule.remove(*id) {
                    r.span = *span;
                    r.title = title.clone();
                    r.description = description.clone();
                    r.attendees_count = *attendees_count;
                    r.updated_by = Some(*by);
                    r.updated_at = Some(*at);
                    if r.is_active() {
                        ledger.reschedule(*id, *span);
                    }
                    schedule.insert(r);
                }
            }
            Event::ReservationCheckedIn {
                id,
                record_id,
                by,
                at,
                ..
            } => {
                if let Some(r) = schedule.get_mut(*id) {
                    r.status = ReservationStatus::CheckedIn;
                    r.checked_in_by = Some(*by);
                    r.checked_in_at = Some(*at);
                    self.record_check_in(CheckInRecord {
                        id: *record_id,
                        reservation_id: *id,
                        user_id: r.user_id,
                        space_id: r.space_id,
                        checked_in_at: *at,
                    });
                }
            }
            Event::ReservationCheckedOut { id, by, at, .. } => {
                if let Some(r) = schedule.get_mut(*id) {
                    r.status = ReservationStatus::Completed;
                    r.checked_out_by = Some(*by);
                    r.checked_out_at = Some(*at);
                }
                ledger.remove(*id);
            }
            Event::ReservationCancelled { id, by, at, .. } => {
                if let Some(r) = schedule.get_mut(*id) {
                    r.status = ReservationStatus::Cancelled;
                    r.cancelled_by = Some(*by);
                    r.cancelled_at = Some(*at);
                }
                ledger.remove(*id);
            }
            Event::CheckInRecorded { record } => {
                self.record_check_in(record.clone());
            }
            // Catalog events are applied by the Catalog
            Event::BuildingSaved { .. }
            | Event::FloorSaved { .. }
            | Event::SpaceSaved { .. }
            | Event::UserSaved { .. } => {}
        }
    }
}

/// The interval a reservation event concerns, for diagnostics.
pub(super) fn event_span(schedule: &SpaceSchedule, event: &Event) -> Option<Span> {
    match event {
        Event::ReservationCreated { reservation } => Some(reservation.span),
        Event::ReservationUpdated { span, .. } => Some(*span),
        Event::ReservationCheckedIn { id, .. }
        | Event::ReservationCheckedOut { id, .. }
        | Event::ReservationCancelled { id, .. } => schedule.get(*id).map(|r| r.span),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(space_id: Ulid, user_id: Ulid, start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            space_id,
            user_id,
            span: Span::new(start, end),
            title: Some("standup".into()),
            description: None,
            attendees_count: 1,
            status: ReservationStatus::Confirmed,
            created_by: user_id,
            created_at: 0,
            updated_by: None,
            updated_at: None,
            cancelled_by: None,
            cancelled_at: None,
            checked_in_by: None,
            checked_in_at: None,
            checked_out_by: None,
            checked_out_at: None,
        }
    }

    #[test]
    fn created_reservation_is_indexed_and_held() {
        let store = ReservationStore::new();
        let (space, user) = (Ulid::new(), Ulid::new());
        let mut schedule = SpaceSchedule::new(space);
        let mut ledger = UserLedger::new(user);
        let r = confirmed(space, user, 100, 200);

        store.apply_event(&mut schedule, &mut ledger, &Event::ReservationCreated { reservation: r.clone() });

        assert_eq!(store.key(&r.id), Some(ReservationKey { space_id: space, user_id: user }));
        assert_eq!(store.ids_for_user(&user), vec![r.id]);
        assert_eq!(schedule.reservations.len(), 1);
        assert_eq!(ledger.active.len(), 1);
    }

    #[test]
    fn check_in_then_out_releases_ledger() {
        let store = ReservationStore::new();
        let (space, user) = (Ulid::new(), Ulid::new());
        let mut schedule = SpaceSchedule::new(space);
        let mut ledger = UserLedger::new(user);
        let r = confirmed(space, user, 100, 200);
        store.apply_event(&mut schedule, &mut ledger, &Event::ReservationCreated { reservation: r.clone() });

        let record_id = Ulid::new();
        store.apply_event(
            &mut schedule,
            &mut ledger,
            &Event::ReservationCheckedIn { id: r.id, space_id: space, record_id, by: user, at: 95 },
        );
        assert_eq!(schedule.get(r.id).unwrap().status, ReservationStatus::CheckedIn);
        assert_eq!(store.check_in(&r.id).unwrap().id, record_id);
        assert_eq!(ledger.active.len(), 1);

        store.apply_event(
            &mut schedule,
            &mut ledger,
            &Event::ReservationCheckedOut { id: r.id, space_id: space, by: user, at: 150 },
        );
        let done = schedule.get(r.id).unwrap();
        assert_eq!(done.status, ReservationStatus::Completed);
        assert_eq!(done.checked_out_at, Some(150));
        assert!(ledger.active.is_empty());
        // Audit trail survives completion
        assert!(store.check_in(&r.id).is_some());
    }

    #[test]
    fn update_moves_reservation_and_ledger() {
        let store = ReservationStore::new();
        let (space, user) = (Ulid::new(), Ulid::new());
        let mut schedule = SpaceSchedule::new(space);
        let mut ledger = UserLedger::new(user);
        let early = confirmed(space, user, 100, 200);
        let late = confirmed(space, user, 300, 400);
        for r in [&early, &late] {
            store.apply_event(&mut schedule, &mut ledger, &Event::ReservationCreated { reservation: r.clone() });
        }

        store.apply_event(
            &mut schedule,
            &mut ledger,
            &Event::ReservationUpdated {
                id: early.id,
                space_id: space,
                span: Span::new(500, 600),
                title: None,
                description: Some("moved".into()),
                attendees_count: 2,
                by: user,
                at: 50,
            },
        );
        assert_eq!(schedule.reservations[0].id, late.id);
        assert_eq!(schedule.reservations[1].id, early.id);
        assert_eq!(schedule.reservations[1].description.as_deref(), Some("moved"));
        assert_eq!(schedule.reservations[1].updated_at, Some(50));
        let entry = ledger.active.iter().find(|e| e.reservation_id == early.id).unwrap();
        assert_eq!(entry.span, Span::new(500, 600));
    }

    #[test]
    fn check_in_record_is_never_overwritten() {
        let store = ReservationStore::new();
        let reservation_id = Ulid::new();
        let first = CheckInRecord {
            id: Ulid::new(),
            reservation_id,
            user_id: Ulid::new(),
            space_id: Ulid::new(),
            checked_in_at: 10,
        };
        let second = CheckInRecord { id: Ulid::new(), checked_in_at: 20, ..first.clone() };
        store.record_check_in(first.clone());
        store.record_check_in(second);
        assert_eq!(store.check_in(&reservation_id), Some(first));
    }
}
