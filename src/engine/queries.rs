use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// The registry view: every lot's name, capacity, and rate.
    /// Read-only; sorted by key for stable output.
    pub async fn list_lots(&self) -> Vec<LotInfo> {
        let lots: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(lots.len());
        for ls in lots {
            let guard = ls.read().await;
            infos.push(LotInfo {
                key: guard.key.clone(),
                name: guard.name.clone(),
                capacity: guard.capacity,
                rate_per_hour: guard.rate_per_hour,
            });
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// All slots of a lot with their cached status. The status may lag
    /// reality until the next reclaim pass; the allocator never trusts
    /// it for the reuse decision.
    pub async fn list_slots(&self, lot: &str) -> Result<Vec<SlotInfo>, EngineError> {
        let key = lot_key(lot);
        let ls = self
            .get_lot(&key)
            .ok_or_else(|| EngineError::UnknownLot(lot.to_string()))?;
        let guard = ls.read().await;
        Ok(guard
            .slots
            .iter()
            .map(|s| SlotInfo {
                number: s.number,
                status: s.status,
            })
            .collect())
    }

    /// Full ledger for one slot, expired entries included — callers
    /// filter by end instant if they only want active bookings.
    pub async fn bookings_for_slot(
        &self,
        lot: &str,
        slot: u32,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let key = lot_key(lot);
        let ls = self
            .get_lot(&key)
            .ok_or_else(|| EngineError::UnknownLot(lot.to_string()))?;
        let guard = ls.read().await;
        let s = guard.slot(slot).ok_or(EngineError::UnknownSlot(slot))?;
        Ok(s.bookings
            .iter()
            .map(|b| booking_info(&guard.key, s.number, b))
            .collect())
    }

    /// The "view my tickets" read path: every booking attributed to the
    /// account key, newest start first.
    pub async fn bookings_for_requester(&self, account: &str) -> Vec<BookingInfo> {
        let Some(refs) = self.by_requester.get(account).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let mut by_lot: HashMap<String, Vec<Ulid>> = HashMap::new();
        for (lot, id) in refs {
            by_lot.entry(lot).or_default().push(id);
        }

        let mut out = Vec::new();
        for (lot, ids) in by_lot {
            let Some(ls) = self.get_lot(&lot) else { continue };
            let guard = ls.read().await;
            for slot in &guard.slots {
                for b in &slot.bookings {
                    if ids.contains(&b.id) {
                        out.push(booking_info(&guard.key, slot.number, b));
                    }
                }
            }
        }
        out.sort_by(|a, b| b.start.cmp(&a.start));
        out
    }

    /// Windows inside [query_start, query_end) where at least one slot
    /// is open, via the sweep-line in `availability`.
    pub async fn lot_availability(
        &self,
        lot: &str,
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        if query_end <= query_start {
            return Err(EngineError::Validation("non-positive interval"));
        }
        if query_end - query_start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let key = lot_key(lot);
        let ls = self
            .get_lot(&key)
            .ok_or_else(|| EngineError::UnknownLot(lot.to_string()))?;
        let guard = ls.read().await;

        let query = Span::new(query_start, query_end);
        let mut free = free_windows(&guard, &query, now_ms());
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }
}

fn booking_info(lot: &str, slot: u32, b: &Booking) -> BookingInfo {
    BookingInfo {
        id: b.id,
        lot: lot.to_string(),
        slot,
        plate: b.requester.plate.clone(),
        account_key: b.requester.account_key.clone(),
        start: b.span.start,
        end: b.span.end,
        created_at: b.created_at,
    }
}
