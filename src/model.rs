use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{DEFAULT_CHECK_IN_WINDOW_MINUTES, DEFAULT_MAX_CONCURRENT_RESERVATIONS};

/// Unix milliseconds, UTC.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

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

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS as f64
    }

    /// Half-open overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Closed-interval overlap: touching endpoints count. Used for quota.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

/// Capability token for one request: who is acting, and with which role.
/// Resolved once by the caller and passed into every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Ulid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn user(user_id: Ulid) -> Self {
        Self::new(user_id, Role::User)
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act on anyone's behalf; users only on their own.
    pub fn may_act_for(&self, owner: Ulid) -> bool {
        self.is_admin() || self.user_id == owner
    }
}

// ── Catalog ──────────────────────────────────────────────────────

/// Per-building booking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRules {
    /// Max active reservations a user may hold overlapping one booking (K).
    pub max_concurrent_reservations: u32,
    /// Lead time before `start` during which check-in opens.
    pub check_in_window_minutes: u32,
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            max_concurrent_reservations: DEFAULT_MAX_CONCURRENT_RESERVATIONS,
            check_in_window_minutes: DEFAULT_CHECK_IN_WINDOW_MINUTES,
        }
    }
}

impl BookingRules {
    pub fn check_in_window_ms(&self) -> Ms {
        self.check_in_window_minutes as Ms * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    pub id: Ulid,
    pub name: String,
    pub address: Option<String>,
    pub is_active: bool,
    pub rules: BookingRules,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Floor {
    pub id: Ulid,
    pub building_id: Ulid,
    pub floor_number: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceKind {
    Desk,
    Room,
    Other,
}

impl SpaceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "desk" => Some(SpaceKind::Desk),
            "room" | "meeting_room" => Some(SpaceKind::Room),
            "other" => Some(SpaceKind::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Ulid,
    pub floor_id: Ulid,
    pub name: Option<String>,
    pub kind: SpaceKind,
    pub capacity: u32,
    pub is_active: bool,
    pub is_bookable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub is_active: bool,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Holds the space and counts toward the user's quota.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::CheckedIn)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    pub fn counts_toward_occupancy(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Some(ReservationStatus::Confirmed),
            "checked_in" => Some(ReservationStatus::CheckedIn),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub title: Option<String>,
    pub description: Option<String>,
    pub attendees_count: u32,
    pub status: ReservationStatus,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub updated_by: Option<Ulid>,
    pub updated_at: Option<Ms>,
    pub cancelled_by: Option<Ulid>,
    pub cancelled_at: Option<Ms>,
    pub checked_in_by: Option<Ulid>,
    pub checked_in_at: Option<Ms>,
    pub checked_out_by: Option<Ulid>,
    pub checked_out_at: Option<Ms>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Immutable audit entry written by a successful check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub user_id: Ulid,
    pub space_id: Ulid,
    pub checked_in_at: Ms,
}

/// Booking request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub title: Option<String>,
    pub description: Option<String>,
    pub attendees_count: Option<u32>,
}

/// Partial edit; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub attendees_count: Option<u32>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.end.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.attendees_count.is_none()
    }
}

// ── Per-space and per-user state ─────────────────────────────────

/// All reservations on one space, sorted by `span.start`.
/// The write lock around it is the unit of conflict serialization.
#[derive(Debug, Clone)]
pub struct SpaceSchedule {
    pub space_id: Ulid,
    pub reservations: Vec<Reservation>,
}

impl SpaceSchedule {
    pub fn new(space_id: Ulid) -> Self {
        Self {
            space_id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub reservation_id: Ulid,
    pub space_id: Ulid,
    pub span: Span,
}

/// A user's active reservations across all spaces.
/// The mutex around it is the unit of quota serialization.
#[derive(Debug, Clone)]
pub struct UserLedger {
    pub user_id: Ulid,
    pub active: Vec<LedgerEntry>,
}

impl UserLedger {
    pub fn new(user_id: Ulid) -> Self {
        Self {
            user_id,
            active: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: LedgerEntry) {
        self.remove(entry.reservation_id);
        self.active.push(entry);
    }

    pub fn remove(&mut self, reservation_id: Ulid) -> Option<LedgerEntry> {
        let pos = self
            .active
            .iter()
            .position(|e| e.reservation_id == reservation_id)?;
        Some(self.active.swap_remove(pos))
    }

    pub fn reschedule(&mut self, reservation_id: Ulid, span: Span) {
        if let Some(entry) = self
            .active
            .iter_mut()
            .find(|e| e.reservation_id == reservation_id)
        {
            entry.span = span;
        }
    }
}

// ── Reporting ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyScope {
    Space(Ulid),
    User(Ulid),
    Floor(Ulid),
    Building(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupancyStats {
    pub total_reservations: usize,
    pub total_hours: f64,
    /// Percent of available hours that were booked, two decimals.
    pub occupancy_rate: f64,
}

// ── WAL ──────────────────────────────────────────────────────────

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BuildingSaved {
        building: Building,
    },
    FloorSaved {
        floor: Floor,
    },
    SpaceSaved {
        space: Space,
    },
    UserSaved {
        user: User,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        space_id: Ulid,
        span: Span,
        title: Option<String>,
        description: Option<String>,
        attendees_count: u32,
        by: Ulid,
        at: Ms,
    },
    ReservationCheckedIn {
        id: Ulid,
        space_id: Ulid,
        record_id: Ulid,
        by: Ulid,
        at: Ms,
    },
    ReservationCheckedOut {
        id: Ulid,
        space_id: Ulid,
        by: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        space_id: Ulid,
        by: Ulid,
        at: Ms,
    },
    /// Written only by compaction to carry the audit trail forward.
    CheckInRecorded {
        record: CheckInRecord,
    },
}

impl Event {
    /// The space whose schedule a reservation event touches.
    pub fn reservation_space(&self) -> Option<Ulid> {
        match self {
            Event::ReservationCreated { reservation } => Some(reservation.space_id),
            Event::ReservationUpdated { space_id, .. }
            | Event::ReservationCheckedIn { space_id, .. }
            | Event::ReservationCheckedOut { space_id, .. }
            | Event::ReservationCancelled { space_id, .. } => Some(*space_id),
            Event::CheckInRecorded { record } => Some(record.space_id),
            Event::BuildingSaved { .. }
            | Event::FloorSaved { .. }
            | Event::SpaceSaved { .. }
            | Event::UserSaved { .. } => None,
        }
    }
}
