//! Reservation lifecycle.
//!
//! ```text
//! confirmed ──check_in──▶ checked_in ──check_out──▶ completed
//!     │                       │
//!     └──────cancel──────▶ cancelled ◀──cancel──────┘
//! ```
//!
//! `completed` and `cancelled` are terminal.

use crate::model::*;

use super::error::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CheckIn,
    CheckOut,
    Cancel,
}

/// Status after applying `transition`, ignoring time guards.
pub fn next_status(
    current: ReservationStatus,
    transition: Transition,
) -> Result<ReservationStatus, StateError> {
    use ReservationStatus::*;
    if current.is_terminal() {
        return Err(StateError::Terminal(current));
    }
    match (current, transition) {
        (Confirmed, Transition::CheckIn) => Ok(CheckedIn),
        (CheckedIn, Transition::CheckIn) => Err(StateError::AlreadyCheckedIn),
        (CheckedIn, Transition::CheckOut) => Ok(Completed),
        (Confirmed, Transition::CheckOut) => Err(StateError::NotCheckedIn),
        (_, Transition::Cancel) => Ok(Cancelled),
        (Completed | Cancelled, _) => Err(StateError::Terminal(current)),
    }
}

/// Check-in is allowed from `start - window` through `end`, inclusive.
pub fn check_in(
    reservation: &Reservation,
    now: Ms,
    window_ms: Ms,
) -> Result<ReservationStatus, StateError> {
    let next = next_status(reservation.status, Transition::CheckIn)?;
    let opens_at = reservation.span.start - window_ms;
    if now < opens_at {
        return Err(StateError::TooEarlyToCheckIn { opens_at });
    }
    if now > reservation.span.end {
        return Err(StateError::ReservationExpired {
            ended_at: reservation.span.end,
        });
    }
    Ok(next)
}

pub fn check_out(reservation: &Reservation) -> Result<ReservationStatus, StateError> {
    next_status(reservation.status, Transition::CheckOut)
}

/// Cancellation is not time-gated; only terminal states refuse it.
pub fn cancel(reservation: &Reservation) -> Result<ReservationStatus, StateError> {
    next_status(reservation.status, Transition::Cancel)
}

pub fn ensure_editable(reservation: &Reservation) -> Result<(), StateError> {
    if reservation.status.is_terminal() {
        return Err(StateError::Terminal(reservation.status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;
    const WINDOW: Ms = 15 * M;

    fn reservation(status: ReservationStatus) -> Reservation {
        let user = Ulid::new();
        Reservation {
            id: Ulid::new(),
            space_id: Ulid::new(),
            user_id: user,
            span: Span::new(10 * H, 11 * H),
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

    #[test]
    fn legal_transitions() {
        use ReservationStatus::*;
        assert_eq!(next_status(Confirmed, Transition::CheckIn), Ok(CheckedIn));
        assert_eq!(next_status(CheckedIn, Transition::CheckOut), Ok(Completed));
        assert_eq!(next_status(Confirmed, Transition::Cancel), Ok(Cancelled));
        assert_eq!(next_status(CheckedIn, Transition::Cancel), Ok(Cancelled));
    }

    #[test]
    fn nothing_leaves_terminal_states() {
        use ReservationStatus::*;
        for terminal in [Completed, Cancelled] {
            for t in [Transition::CheckIn, Transition::CheckOut, Transition::Cancel] {
                assert_eq!(next_status(terminal, t), Err(StateError::Terminal(terminal)));
            }
        }
    }

    #[test]
    fn check_in_window_bounds() {
        let r = reservation(ReservationStatus::Confirmed);
        let start = r.span.start;
        assert_eq!(
            check_in(&r, start - 16 * M, WINDOW),
            Err(StateError::TooEarlyToCheckIn { opens_at: start - WINDOW })
        );
        assert_eq!(check_in(&r, start - 15 * M, WINDOW), Ok(ReservationStatus::CheckedIn));
        assert_eq!(check_in(&r, start - 14 * M, WINDOW), Ok(ReservationStatus::CheckedIn));
        assert_eq!(check_in(&r, r.span.end, WINDOW), Ok(ReservationStatus::CheckedIn));
        assert_eq!(
            check_in(&r, r.span.end + 1_000, WINDOW),
            Err(StateError::ReservationExpired { ended_at: r.span.end })
        );
    }

    #[test]
    fn re_entrant_check_in_rejected() {
        let r = reservation(ReservationStatus::CheckedIn);
        assert_eq!(check_in(&r, r.span.start, WINDOW), Err(StateError::AlreadyCheckedIn));
    }

    #[test]
    fn check_out_requires_check_in() {
        assert_eq!(
            check_out(&reservation(ReservationStatus::Confirmed)),
            Err(StateError::NotCheckedIn)
        );
        assert_eq!(
            check_out(&reservation(ReservationStatus::CheckedIn)),
            Ok(ReservationStatus::Completed)
        );
    }

    #[test]
    fn cancel_guards_only_terminal() {
        assert!(cancel(&reservation(ReservationStatus::Confirmed)).is_ok());
        assert!(cancel(&reservation(ReservationStatus::CheckedIn)).is_ok());
        assert_eq!(
            cancel(&reservation(ReservationStatus::Completed)),
            Err(StateError::Terminal(ReservationStatus::Completed))
        );
        assert_eq!(
            cancel(&reservation(ReservationStatus::Cancelled)),
            Err(StateError::Terminal(ReservationStatus::Cancelled))
        );
    }

    #[test]
    fn editing_requires_active() {
        assert!(ensure_editable(&reservation(ReservationStatus::Confirmed)).is_ok());
        assert!(ensure_editable(&reservation(ReservationStatus::CheckedIn)).is_ok());
        assert!(ensure_editable(&reservation(ReservationStatus::Completed)).is_err());
    }
}
