use tokio::sync::{oneshot, RwLock};
use tracing::warn;
use ulid::Ulid;

use std::sync::Arc;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{now_ms, slot_conflicts, validate_booking_span, validate_requester};
use super::{Engine, EngineError, SharedLotState, WalCommand};

/// Mark every slot with no active booking Free. Idempotent; safe to run
/// on every call. Returns the number of slots flipped.
pub(super) fn reclaim_expired(ls: &mut LotState, now: Ms) -> usize {
    let mut reclaimed = 0;
    for slot in &mut ls.slots {
        if slot.status == SlotStatus::Occupied && !slot.has_active(now) {
            slot.status = SlotStatus::Free;
            reclaimed += 1;
        }
    }
    reclaimed
}

impl Engine {
    pub async fn provision_lot(
        &self,
        name: &str,
        capacity: u32,
        rate_per_hour: u32,
    ) -> Result<LotInfo, EngineError> {
        if name.len() > MAX_LOT_NAME_LEN {
            return Err(EngineError::LimitExceeded("lot name too long"));
        }
        let key = lot_key(name);
        if key.is_empty() {
            return Err(EngineError::Validation("empty lot name"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("lot needs at least one slot"));
        }
        if capacity > MAX_SLOTS_PER_LOT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if self.state.len() >= MAX_LOTS {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        if self.state.contains_key(&key) {
            return Err(EngineError::LotExists(key));
        }

        let event = Event::LotProvisioned {
            key: key.clone(),
            name: name.trim().to_string(),
            capacity,
            rate_per_hour,
        };
        self.wal_append(&event).await?;
        let ls = LotState::new(key.clone(), name.trim().to_string(), capacity, rate_per_hour);
        let info = LotInfo {
            key: key.clone(),
            name: ls.name.clone(),
            capacity,
            rate_per_hour,
        };
        self.state.insert(key.clone(), Arc::new(RwLock::new(ls)));
        self.notify.send(&key, &event);
        metrics::gauge!(observability::LOTS_ACTIVE).set(self.state.len() as f64);
        Ok(info)
    }

    /// Grant a slot for `span`, or say why not. One atomic unit under
    /// the lot's write lock: reclaim sweep, slot selection, WAL append,
    /// and state update all happen with no interleaved writer.
    pub async fn book(
        &self,
        lot: &str,
        requester: Requester,
        span: Span,
    ) -> Result<Ticket, EngineError> {
        validate_requester(&requester)?;
        validate_booking_span(&span)?;
        let key = lot_key(lot);
        let ls = self
            .get_lot(&key)
            .ok_or_else(|| EngineError::UnknownLot(lot.to_string()))?;
        let mut guard = ls.write().await;
        let now = now_ms();

        // 1. Reclaim pass: slots whose bookings have all ended go Free.
        let reclaimed = reclaim_expired(&mut guard, now);
        if reclaimed > 0 {
            metrics::counter!(observability::SLOTS_RECLAIMED_TOTAL).increment(reclaimed as u64);
        }

        // 2. Fast path: lowest-numbered Free slot. A Free slot has no
        //    active booking, so nothing it holds can conflict.
        // 3. Reuse path: lowest-numbered slot whose active bookings
        //    leave the candidate interval open.
        let selected = guard
            .slots
            .iter()
            .find(|s| s.status == SlotStatus::Free)
            .map(|s| s.number)
            .or_else(|| {
                guard
                    .slots
                    .iter()
                    .find(|s| !slot_conflicts(s, &span, now))
                    .map(|s| s.number)
            });

        // 4. Exhaustion: every slot conflicts; nothing is written.
        let Some(slot_no) = selected else {
            metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL).increment(1);
            return Err(EngineError::NoAvailability);
        };

        if let Some(s) = guard.slot(slot_no)
            && s.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
                return Err(EngineError::LimitExceeded("too many bookings on slot"));
            }

        let id = Ulid::new();
        let event = Event::BookingRecorded {
            id,
            lot: key,
            slot: slot_no,
            span,
            requester,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_GRANTED_TOTAL).increment(1);
        Ok(Ticket {
            slot: slot_no,
            booking_id: id,
        })
    }

    /// Owner override: mark a slot Free regardless of ledger state.
    /// Skips conflict checking entirely (error correction, not
    /// scheduling), so every use is audit-logged and counted.
    pub async fn free_slot(&self, lot: &str, slot: u32) -> Result<(), EngineError> {
        let key = lot_key(lot);
        let ls = self
            .get_lot(&key)
            .ok_or_else(|| EngineError::UnknownLot(lot.to_string()))?;
        let mut guard = ls.write().await;
        let now = now_ms();
        let active = match guard.slot(slot) {
            Some(s) => s.overlapping(&Span::new(now, MAX_VALID_TIMESTAMP_MS)).count(),
            None => return Err(EngineError::UnknownSlot(slot)),
        };
        warn!(
            lot = %key,
            slot,
            active_bookings = active,
            "manual slot override: marking free"
        );
        metrics::counter!(observability::SLOT_OVERRIDES_TOTAL).increment(1);

        let event = Event::SlotFreed { lot: key, slot };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Sweep every lot once. The reaper calls this periodically so
    /// cached statuses read by `list_slots` go stale for at most one
    /// tick; `book()` runs its own sweep regardless.
    pub async fn reclaim_expired_slots(&self) -> usize {
        let now = now_ms();
        let mut total = 0;
        let lots: Vec<SharedLotState> = self.state.iter().map(|e| e.value().clone()).collect();
        for ls in lots {
            let mut guard = ls.write().await;
            total += reclaim_expired(&mut guard, now);
        }
        if total > 0 {
            metrics::counter!(observability::SLOTS_RECLAIMED_TOTAL).increment(total as u64);
        }
        total
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate current state. Ledger entries ended before the retention
    /// horizon are dropped here — the one place history is shed.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let now = now_ms();
        let horizon = now - BOOKING_RETENTION_MS;
        let mut events = Vec::new();

        let lots: Vec<SharedLotState> = self.state.iter().map(|e| e.value().clone()).collect();
        for ls in lots {
            let guard = ls.read().await;
            events.push(Event::LotProvisioned {
                key: guard.key.clone(),
                name: guard.name.clone(),
                capacity: guard.capacity,
                rate_per_hour: guard.rate_per_hour,
            });
            for slot in &guard.slots {
                for b in &slot.bookings {
                    if b.span.end >= horizon {
                        events.push(Event::BookingRecorded {
                            id: b.id,
                            lot: guard.key.clone(),
                            slot: slot.number,
                            span: b.span,
                            requester: b.requester.clone(),
                            created_at: b.created_at,
                        });
                    }
                }
                // Preserve manual overrides: replay would re-mark this
                // slot Occupied from its active bookings otherwise.
                if slot.status == SlotStatus::Free && slot.has_active(now) {
                    events.push(Event::SlotFreed {
                        lot: guard.key.clone(),
                        slot: slot.number,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
