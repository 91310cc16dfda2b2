use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single request or booking may not reserve more than a semester.
pub const MAX_SPAN_DURATION_MS: Ms = 180 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_ROLL_NUMBER_LEN: usize = 32;

pub const MAX_REQUEST_QUANTITY: u32 = 100_000;
pub const MAX_ENTRIES_PER_TIMELINE: usize = 100_000;

pub const MAX_LOG_PAGE_SIZE: usize = 500;
pub const DEFAULT_LOG_PAGE_SIZE: usize = 50;
