use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that periodically returns expired slots to free, so
/// the cached status readers see lags reality by at most one tick.
/// The allocator runs its own reclaim pass on every booking regardless.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let reclaimed = engine.reclaim_expired_slots().await;
        if reclaimed > 0 {
            info!("reclaimed {reclaimed} expired slots");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_slots() {
        let path = test_wal_path("reaper_sweep.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        engine.provision_lot("alpha", 1, 40).await.unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as Ms;
        // Book a span that already ended; the slot is cached Occupied
        // until a sweep runs.
        engine
            .book(
                "alpha",
                Requester::with_plate("KA-01-1234"),
                Span::new(now - 2000, now - 1000),
            )
            .await
            .unwrap();

        let occupied = engine.list_slots("alpha").await.unwrap();
        assert_eq!(occupied[0].status, SlotStatus::Occupied);

        let reclaimed = engine.reclaim_expired_slots().await;
        assert_eq!(reclaimed, 1);

        let free = engine.list_slots("alpha").await.unwrap();
        assert_eq!(free[0].status, SlotStatus::Free);

        // Idempotent: a second sweep has nothing to do.
        assert_eq!(engine.reclaim_expired_slots().await, 0);
    }
}
