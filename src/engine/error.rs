use ulid::Ulid;

use crate::model::{Ms, ReservationStatus};

/// A lifecycle guard rejected the requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    TooEarlyToCheckIn { opens_at: Ms },
    ReservationExpired { ended_at: Ms },
    AlreadyCheckedIn,
    NotCheckedIn,
    Terminal(ReservationStatus),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::TooEarlyToCheckIn { opens_at } => {
                write!(f, "too early to check in: check-in opens at {opens_at}")
            }
            StateError::ReservationExpired { ended_at } => {
                write!(f, "reservation expired at {ended_at}")
            }
            StateError::AlreadyCheckedIn => write!(f, "reservation is already checked in"),
            StateError::NotCheckedIn => write!(f, "reservation is not checked in"),
            StateError::Terminal(status) => write!(f, "reservation is already {status}"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    SpaceUnavailable(Ulid),
    ScheduleConflict(Ulid),
    QuotaExceeded { limit: u32 },
    Forbidden,
    InvalidState(StateError),
    HasActiveReservations(Ulid),
    LimitExceeded(&'static str),
    StoreFailure(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SpaceUnavailable(id) => {
                write!(f, "space {id} is not available for booking")
            }
            EngineError::ScheduleConflict(id) => {
                write!(f, "schedule conflict with reservation: {id}")
            }
            EngineError::QuotaExceeded { limit } => {
                write!(f, "quota exceeded: at most {limit} overlapping active reservations")
            }
            EngineError::Forbidden => write!(f, "forbidden"),
            EngineError::InvalidState(e) => write!(f, "invalid state: {e}"),
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot deactivate {id}: has active reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreFailure(e) => write!(f, "store failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        EngineError::InvalidState(e)
    }
}
