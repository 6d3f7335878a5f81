use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::store::MemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the store's log once `threshold` appends have accumulated.
/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    debug!(appends, threshold, "compacting store log");
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            error!("store compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the log short. Runs until `cancel` fires.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                compact_if_due(&store, threshold).await;
            }
        }
    }
    debug!("compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::model::Field;
    use crate::store::{RemoteStore, WriteMode};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("shiftbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn record(value: i64) -> crate::model::Record {
        [("maxReservations".to_string(), Field::Int(value))].into()
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = MemoryStore::open(&path).unwrap();
        for n in 1..=3 {
            store
                .put("shifts/2024-05-01", "19:00", record(n), WriteMode::Merge)
                .await
                .unwrap();
        }
        assert!(!compact_if_due(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 3);

        assert!(compact_if_due(&store, 3).await);
        assert_eq!(store.appends_since_compact().await, 0);
        drop(store);

        // One live record survives, with its latest value.
        let reopened = MemoryStore::open(&path).unwrap();
        let shifts = reopened.read("shifts/2024-05-01").await.unwrap();
        assert_eq!(shifts.records.len(), 1);
        assert_eq!(shifts.records["19:00"]["maxReservations"], Field::Int(3));
    }

    #[tokio::test]
    async fn volatile_store_is_never_compacted() {
        let store = MemoryStore::new();
        store
            .put("shifts/2024-05-01", "19:00", record(1), WriteMode::Merge)
            .await
            .unwrap();
        assert!(!compact_if_due(&store, 0).await);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_compactor(store, 10, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
