//! Hard operational limits and fixed shop parameters.

use time::Weekday;

use crate::model::Min;

/// Widest date range a single query or booking may cover.
pub const MAX_RANGE_DAYS: i64 = 60;

/// Distinct bike types in one booking.
pub const MAX_BIKE_TYPES_PER_BOOKING: usize = 16;

/// Distinct add-on kinds in one booking.
pub const MAX_ADDONS_PER_BOOKING: usize = 16;

/// Per-type quantity in one booking.
pub const MAX_QTY_PER_TYPE: u32 = 50;

/// Fleet size ceiling for a single stock-day row.
pub const MAX_BASE_QUANTITY: u32 = 1000;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_CANCEL_REASON_LEN: usize = 1024;
pub const MAX_BIKE_NUMBERS: usize = 64;

/// Optimistic commit attempts before a version conflict is surfaced as a
/// capacity failure.
pub const MAX_COMMIT_RETRIES: u32 = 3;

/// Post-use grace period appended after every timed rental, minutes.
pub const DEFAULT_BUFFER_MIN: Min = 60;

/// Shop hours: 08:00 to 18:30, minutes since midnight.
pub const OPEN_MIN: Min = 8 * 60;
pub const CLOSE_MIN: Min = 18 * 60 + 30;

/// Fixed weekly closure day.
pub const CLOSED_WEEKDAY: Weekday = Weekday::Wednesday;

/// Consecutive weekend/holiday days that make a busy-season block.
pub const HOLIDAY_BLOCK_MIN_DAYS: u32 = 3;
