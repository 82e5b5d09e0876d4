//! Hard caps. Every limit rejects with `EngineError::LimitExceeded`
//! before any state is touched.

use crate::model::Ms;

pub const MAX_LOTS: usize = 10_000;
pub const MAX_LOT_NAME_LEN: usize = 256;
pub const MAX_SLOTS_PER_LOT: u32 = 10_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 100_000;

pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_REQUESTER_FIELD_LEN: usize = 256;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z — far enough out to be a config error, not a booking.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest availability query window (31 days).
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * 24 * 3_600_000;

/// Bookings ended longer ago than this are dropped when the WAL compacts.
pub const BOOKING_RETENTION_MS: Ms = 30 * 24 * 3_600_000;
