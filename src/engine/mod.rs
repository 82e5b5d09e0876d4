mod allocator;
mod availability;
mod conflict;
mod error;
mod queries;

pub use availability::{free_windows, merge_overlapping, saturated_spans, subtract_intervals};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLotState = Arc<RwLock<LotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<String, SharedLotState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: requester account key → bookings (lot key, id).
    pub(super) by_requester: DashMap<String, Vec<(String, Ulid)>>,
}

/// Apply an event directly to a LotState (no locking — caller holds the
/// lock). The ledger append and the cached-status transition are one
/// step here, so they can never partially apply.
fn apply_to_lot(
    ls: &mut LotState,
    event: &Event,
    by_requester: &DashMap<String, Vec<(String, Ulid)>>,
) {
    match event {
        Event::BookingRecorded {
            id,
            lot,
            slot,
            span,
            requester,
            created_at,
        } => {
            if let Some(account) = &requester.account_key {
                by_requester
                    .entry(account.clone())
                    .or_default()
                    .push((lot.clone(), *id));
            }
            if let Some(s) = ls.slot_mut(*slot) {
                s.insert_booking(Booking {
                    id: *id,
                    span: *span,
                    requester: requester.clone(),
                    created_at: *created_at,
                });
                s.status = SlotStatus::Occupied;
            }
        }
        Event::SlotFreed { slot, .. } => {
            if let Some(s) = ls.slot_mut(*slot) {
                s.status = SlotStatus::Free;
            }
        }
        // LotProvisioned is handled at the DashMap level, not here
        Event::LotProvisioned { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            by_requester: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            match event {
                Event::LotProvisioned {
                    key,
                    name,
                    capacity,
                    rate_per_hour,
                } => {
                    let ls =
                        LotState::new(key.clone(), name.clone(), *capacity, *rate_per_hour);
                    engine.state.insert(key.clone(), Arc::new(RwLock::new(ls)));
                }
                other => {
                    if let Some(entry) = engine.state.get(other.lot_key()) {
                        let ls_arc = entry.value().clone();
                        let mut guard = ls_arc.try_write().expect("replay: uncontended write");
                        apply_to_lot(&mut guard, other, &engine.by_requester);
                    }
                }
            }
        }

        // Replay marks every recorded slot Occupied; sweep once so
        // statuses reflect bookings that expired while we were down.
        let now = conflict::now_ms();
        for entry in engine.state.iter() {
            let ls_arc = entry.value().clone();
            let mut guard = ls_arc.try_write().expect("replay: uncontended write");
            allocator::reclaim_expired(&mut guard, now);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Look up a lot by its pre-normalized key.
    pub fn get_lot(&self, key: &str) -> Option<SharedLotState> {
        self.state.get(key).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify in one call, under the caller's lock.
    /// State is only mutated after the WAL acknowledges, so a failed
    /// append leaves nothing behind.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut LotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let key = event.lot_key().to_string();
        apply_to_lot(ls, event, &self.by_requester);
        self.notify.send(&key, event);
        Ok(())
    }

    /// Swap in a sender whose receiver is gone, so every append fails.
    /// Lets tests exercise the persistence-failure path.
    #[cfg(test)]
    pub(super) fn sever_wal_writer(&mut self) {
        let (tx, _rx) = mpsc::channel(1);
        self.wal_tx = tx;
    }
}
