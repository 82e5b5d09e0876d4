use chrono::DateTime;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// True iff any active booking on the slot overlaps the candidate.
/// Expired bookings (end <= now) never conflict. Must only be called
/// under the lot's write lock, in the same critical section as the
/// ledger append that follows.
pub(crate) fn slot_conflicts(slot: &SlotState, candidate: &Span, now: Ms) -> bool {
    slot.overlapping(candidate).any(|b| b.span.end > now)
}

pub(crate) fn validate_requester(requester: &Requester) -> Result<(), EngineError> {
    if requester.plate.trim().is_empty() {
        return Err(EngineError::Validation("missing vehicle plate"));
    }
    if requester.plate.len() > MAX_PLATE_LEN {
        return Err(EngineError::LimitExceeded("plate too long"));
    }
    for field in [
        &requester.driver_name,
        &requester.phone,
        &requester.owner_name,
        &requester.owner_phone,
        &requester.account_key,
    ]
    .into_iter()
    .flatten()
    {
        if field.len() > MAX_REQUESTER_FIELD_LEN {
            return Err(EngineError::LimitExceeded("requester field too long"));
        }
    }
    Ok(())
}

/// A booking interval must be positive, inside the valid timestamp
/// range, and fall on a single calendar day (UTC).
pub(crate) fn validate_booking_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.end <= span.start {
        return Err(EngineError::Validation("non-positive interval"));
    }
    // end - 1 keeps an interval ending exactly at midnight on its own day.
    let start_day = DateTime::from_timestamp_millis(span.start).map(|dt| dt.date_naive());
    let end_day = DateTime::from_timestamp_millis(span.end - 1).map(|dt| dt.date_naive());
    if start_day != end_day {
        return Err(EngineError::Validation("interval crosses midnight"));
    }
    Ok(())
}
