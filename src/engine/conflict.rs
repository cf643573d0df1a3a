use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// First active reservation on the space whose half-open span overlaps `span`.
/// `exclude` skips the reservation being edited.
pub fn find_conflict<'a>(
    schedule: &'a SpaceSchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    schedule
        .overlapping(span)
        .filter(|r| r.is_active())
        .filter(|r| Some(r.id) != exclude)
        .find(|r| r.span.overlaps(span))
}

pub(crate) fn check_no_conflict(
    schedule: &SpaceSchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(schedule, span, exclude) {
        Some(existing) => Err(EngineError::ScheduleConflict(existing.id)),
        None => Ok(()),
    }
}

/// Active reservations on the space that end after `now`. Deactivation
/// of the space (or anything above it) is blocked while any exist.
pub fn live_reservations(schedule: &SpaceSchedule, now: Ms) -> impl Iterator<Item = &Reservation> {
    schedule.active().filter(move |r| r.span.end > now)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;

    fn reservation(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        let user = Ulid::new();
        Reservation {
            id: Ulid::new(),
            space_id: Ulid::nil(),
            user_id: user,
            span: Span::new(start, end),
            title: None,
            description: None,
            attendees_count: 1,
            status,
            created_by: user,
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

    fn schedule(reservations: Vec<Reservation>) -> SpaceSchedule {
        let mut s = SpaceSchedule::new(Ulid::nil());
        for r in reservations {
            s.insert(r);
        }
        s
    }

    #[test]
    fn overlapping_active_reservation_conflicts() {
        let existing = reservation(10 * H, 11 * H, ReservationStatus::Confirmed);
        let id = existing.id;
        let s = schedule(vec![existing]);
        let hit = find_conflict(&s, &Span::new(10 * H + H / 2, 11 * H + H / 2), None);
        assert_eq!(hit.map(|r| r.id), Some(id));
    }

    #[test]
    fn adjacent_reservation_does_not_conflict() {
        let s = schedule(vec![reservation(10 * H, 11 * H, ReservationStatus::Confirmed)]);
        assert!(find_conflict(&s, &Span::new(11 * H, 12 * H), None).is_none());
        assert!(find_conflict(&s, &Span::new(9 * H, 10 * H), None).is_none());
    }

    #[test]
    fn checked_in_reservation_conflicts() {
        let s = schedule(vec![reservation(10 * H, 11 * H, ReservationStatus::CheckedIn)]);
        assert!(check_no_conflict(&s, &Span::new(10 * H, 11 * H), None).is_err());
    }

    #[test]
    fn terminal_reservations_are_ignored() {
        let s = schedule(vec![
            reservation(10 * H, 11 * H, ReservationStatus::Cancelled),
            reservation(10 * H, 11 * H, ReservationStatus::Completed),
        ]);
        assert!(find_conflict(&s, &Span::new(10 * H, 11 * H), None).is_none());
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let existing = reservation(10 * H, 11 * H, ReservationStatus::Confirmed);
        let id = existing.id;
        let s = schedule(vec![existing]);
        assert!(find_conflict(&s, &Span::new(10 * H, 12 * H), Some(id)).is_none());
    }

    #[test]
    fn long_reservation_spanning_query_conflicts() {
        // Starts well before the candidate; the start-time index must not hide it.
        let s = schedule(vec![
            reservation(0, 24 * H, ReservationStatus::Confirmed),
            reservation(30 * H, 31 * H, ReservationStatus::Confirmed),
        ]);
        assert!(find_conflict(&s, &Span::new(12 * H, 13 * H), None).is_some());
    }

    #[test]
    fn every_active_reservation_is_considered() {
        let mut rs: Vec<_> = (0..10)
            .map(|i| reservation(i * H, i * H + H / 2, ReservationStatus::Cancelled))
            .collect();
        let live = reservation(5 * H, 6 * H, ReservationStatus::Confirmed);
        let live_id = live.id;
        rs.push(live);
        let s = schedule(rs);
        let hit = find_conflict(&s, &Span::new(5 * H + 1, 5 * H + 2), None);
        assert_eq!(hit.map(|r| r.id), Some(live_id));
    }

    #[test]
    fn live_reservations_respect_now() {
        let s = schedule(vec![
            reservation(0, H, ReservationStatus::Confirmed),
            reservation(2 * H, 3 * H, ReservationStatus::CheckedIn),
            reservation(4 * H, 5 * H, ReservationStatus::Cancelled),
        ]);
        assert_eq!(live_reservations(&s, 0).count(), 2);
        assert_eq!(live_reservations(&s, H).count(), 1);
        assert_eq!(live_reservations(&s, 3 * H).count(), 0);
    }

    #[test]
    fn validate_span_limits() {
        use crate::limits::*;
        assert!(validate_span(&Span::new(0, H)).is_ok());
        assert!(matches!(
            validate_span(&Span::new(-H, 0)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
