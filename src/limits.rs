use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single reservation may not span more than one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESERVATIONS_PER_EQUIPMENT: usize = 100_000;
pub const MAX_UNITS_PER_EQUIPMENT: u32 = 10_000;

pub const MAX_CUSTOMER_NOTES_LEN: usize = 1_000;
pub const MAX_ADMIN_NOTES_LEN: usize = 1_000;
pub const MAX_DAMAGE_REPORT_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;

pub const MAX_REVIEW_TITLE_LEN: usize = 100;
pub const MAX_REVIEW_COMMENT_LEN: usize = 1_000;

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 50;

/// Longest accepted request line on the wire.
pub const MAX_LINE_BYTES: usize = 64 * 1024;
pub const MAX_LISTENS_PER_CONNECTION: usize = 256;
