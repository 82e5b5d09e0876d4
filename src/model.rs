use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type the engine compares.
pub type Ms = i64;

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

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap: a booking ending at 10:00
    /// does not conflict with one starting at 10:00.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Normalize a lot name into its stable key: trimmed, lowercased,
/// whitespace runs collapsed to `_`, everything else outside
/// alphanumerics / `_` / `-` stripped.
pub fn lot_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if c.is_whitespace() {
            pending_sep = !key.is_empty();
        } else if c.is_alphanumeric() || c == '_' || c == '-' {
            if pending_sep {
                key.push('_');
                pending_sep = false;
            }
            key.extend(c.to_lowercase());
        }
    }
    key
}

/// Who a booking is for. The plate is the one required field; the rest
/// is contact detail carried opaquely for the ticket view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub plate: String,
    pub driver_name: Option<String>,
    pub phone: Option<String>,
    pub owner_name: Option<String>,
    pub owner_phone: Option<String>,
    pub account_key: Option<String>,
}

impl Requester {
    pub fn with_plate(plate: impl Into<String>) -> Self {
        Self {
            plate: plate.into(),
            driver_name: None,
            phone: None,
            owner_name: None,
            owner_phone: None,
            account_key: None,
        }
    }
}

/// A committed reservation of one slot. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub span: Span,
    pub requester: Requester,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Free,
    Occupied,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Free => "free",
            SlotStatus::Occupied => "occupied",
        }
    }
}

/// One bookable slot. `status` is a cached view meaning "has at least
/// one booking with end > now"; the ledger is the authority.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub number: u32,
    pub status: SlotStatus,
    /// Ledger entries for this slot, sorted by `span.start`. Expired
    /// bookings stay until compaction-time retention pruning.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            status: SlotStatus::Free,
            bookings: Vec::new(),
        }
    }

    /// Append a booking, maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Only bookings whose span overlaps the query window.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// True if any booking is still active (end instant in the future).
    pub fn has_active(&self, now: Ms) -> bool {
        self.bookings.iter().any(|b| b.span.end > now)
    }
}

/// Per-lot state: the slot pool plus its partitioned ledger. Each lot
/// lives behind its own RwLock — the unit of mutual exclusion.
#[derive(Debug, Clone)]
pub struct LotState {
    pub key: String,
    pub name: String,
    pub capacity: u32,
    pub rate_per_hour: u32,
    /// Slots numbered 1..=capacity, in ascending order.
    pub slots: Vec<SlotState>,
}

impl LotState {
    pub fn new(key: String, name: String, capacity: u32, rate_per_hour: u32) -> Self {
        Self {
            key,
            name,
            capacity,
            rate_per_hour,
            slots: (1..=capacity).map(SlotState::new).collect(),
        }
    }

    pub fn slot(&self, number: u32) -> Option<&SlotState> {
        self.slots.iter().find(|s| s.number == number)
    }

    pub fn slot_mut(&mut self, number: u32) -> Option<&mut SlotState> {
        self.slots.iter_mut().find(|s| s.number == number)
    }

    /// Verification hook: a slot cached Free that still has an active
    /// booking means the cache and the ledger disagree — a core bug.
    pub fn verify_consistency(&self, now: Ms) -> Result<(), ConsistencyViolation> {
        for slot in &self.slots {
            if slot.status == SlotStatus::Free && slot.has_active(now) {
                return Err(ConsistencyViolation {
                    lot: self.key.clone(),
                    slot: slot.number,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyViolation {
    pub lot: String,
    pub slot: u32,
}

impl std::fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slot {} in lot {} cached free but has an active booking",
            self.slot, self.lot
        )
    }
}

impl std::error::Error for ConsistencyViolation {}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LotProvisioned {
        key: String,
        name: String,
        capacity: u32,
        rate_per_hour: u32,
    },
    BookingRecorded {
        id: Ulid,
        lot: String,
        slot: u32,
        span: Span,
        requester: Requester,
        created_at: Ms,
    },
    /// Administrative override: owner marked the slot free regardless
    /// of ledger state.
    SlotFreed {
        lot: String,
        slot: u32,
    },
}

impl Event {
    pub fn lot_key(&self) -> &str {
        match self {
            Event::LotProvisioned { key, .. } => key,
            Event::BookingRecorded { lot, .. } => lot,
            Event::SlotFreed { lot, .. } => lot,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotInfo {
    pub key: String,
    pub name: String,
    pub capacity: u32,
    pub rate_per_hour: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub number: u32,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub lot: String,
    pub slot: u32,
    pub plate: String,
    pub account_key: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub created_at: Ms,
}

/// What a successful `book()` hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub slot: u32,
    pub booking_id: Ulid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            span: Span::new(start, end),
            requester: Requester::with_plate("KA-01-1234"),
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn lot_key_normalization() {
        assert_eq!(lot_key("Alpha Garage"), "alpha_garage");
        assert_eq!(lot_key("  Alpha   Garage  "), "alpha_garage");
        assert_eq!(lot_key("ALPHA"), "alpha");
        assert_eq!(lot_key("a/b\\c"), "abc");
        assert_eq!(lot_key("lot-7"), "lot-7");
        assert_eq!(lot_key("   "), "");
    }

    #[test]
    fn lot_key_is_stable_across_spellings() {
        assert_eq!(lot_key("Central Mall"), lot_key("central   MALL"));
    }

    #[test]
    fn booking_ordering() {
        let mut slot = SlotState::new(1);
        slot.insert_booking(booking(300, 400));
        slot.insert_booking(booking(100, 200));
        slot.insert_booking(booking(200, 300));
        assert_eq!(slot.bookings[0].span.start, 100);
        assert_eq!(slot.bookings[1].span.start, 200);
        assert_eq!(slot.bookings[2].span.start, 300);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut slot = SlotState::new(1);
        slot.insert_booking(booking(100, 200));
        slot.insert_booking(booking(450, 600));
        slot.insert_booking(booking(1000, 1100));

        let query = Span::new(500, 800);
        let hits: Vec<_> = slot.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Booking ending exactly at query.start is NOT overlapping (half-open)
        let mut slot = SlotState::new(1);
        slot.insert_booking(booking(100, 200));
        let hits: Vec<_> = slot.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn has_active_respects_end_instant() {
        let mut slot = SlotState::new(1);
        slot.insert_booking(booking(100, 200));
        assert!(slot.has_active(150));
        assert!(slot.has_active(199));
        assert!(!slot.has_active(200)); // ended exactly now
        assert!(!slot.has_active(500));
    }

    #[test]
    fn lot_state_creates_numbered_slots() {
        let lot = LotState::new("alpha".into(), "Alpha".into(), 3, 40);
        let numbers: Vec<u32> = lot.slots.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(lot.slots.iter().all(|s| s.status == SlotStatus::Free));
    }

    #[test]
    fn consistency_violation_detected() {
        let mut lot = LotState::new("alpha".into(), "Alpha".into(), 1, 40);
        lot.slot_mut(1).unwrap().insert_booking(booking(100, 200));
        // Status left Free while an active booking exists — must be flagged.
        let err = lot.verify_consistency(150).unwrap_err();
        assert_eq!(err.slot, 1);
        // Once the booking has expired, Free is the correct cache value.
        assert!(lot.verify_consistency(300).is_ok());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingRecorded {
            id: Ulid::new(),
            lot: "alpha".into(),
            slot: 2,
            span: Span::new(1000, 2000),
            requester: Requester::with_plate("KA-01-1234"),
            created_at: 500,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
