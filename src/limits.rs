use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_ATTENDEES: u32 = 10_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single reservation: 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Widest reporting/listing window: 366 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESERVATIONS_PER_SPACE: usize = 100_000;
pub const MAX_CATALOG_ENTRIES: usize = 100_000;

pub const MAX_CHECK_IN_WINDOW_MINUTES: u32 = 24 * 60;
pub const MAX_CONCURRENT_RESERVATIONS: u32 = 1_000;

pub const DEFAULT_MAX_CONCURRENT_RESERVATIONS: u32 = 3;
pub const DEFAULT_CHECK_IN_WINDOW_MINUTES: u32 = 15;
