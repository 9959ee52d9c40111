use std::sync::Arc;
use std::time::Duration;

use hookguard_types::{now_ns, GuardError};

use crate::mem::ttl_ns;
use crate::traits::RetentionStore;

/// Periodically deletes terminal records older than the retention window.
///
/// Records in `Pending` or `Processing` are never touched: those are either
/// in flight or crash evidence the guard still has to reconcile.
pub struct RetentionTask<R> {
    store: Arc<R>,
    retention: Duration,
    interval: Duration,
}

impl<R: RetentionStore> RetentionTask<R> {
    pub fn new(store: Arc<R>, retention: Duration, interval: Duration) -> Self {
        RetentionTask { store, retention, interval }
    }

    /// Run one pass and return how many records were removed.
    pub async fn sweep_once(&self) -> Result<usize, GuardError> {
        let cutoff = now_ns().saturating_sub(ttl_ns(self.retention));
        let removed = self.store.purge_terminal_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, cutoff_ns = cutoff, "retention sweep purged terminal records");
        }
        Ok(removed)
    }

    /// Sweep every `interval` until `shutdown` flips to `true` or its sender
    /// is dropped. Errors are logged and the next tick tries again.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "retention sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemRecordStore;
    use crate::traits::RecordStore;
    use hookguard_types::{IdempotencyKey, RecordState, Transition};

    async fn completed(store: &MemRecordStore, k: &str) -> IdempotencyKey {
        let k = IdempotencyKey::new(k).unwrap();
        store.create_if_absent(&k).await.unwrap();
        store
            .compare_and_transition(
                &k,
                Transition::begin_attempt(RecordState::Pending, None, "o".into(), i64::MAX),
            )
            .await
            .unwrap();
        store.compare_and_transition(&k, Transition::complete("o".into(), vec![])).await.unwrap();
        k
    }

    #[tokio::test]
    async fn sweep_keeps_recent_records() {
        let store = Arc::new(MemRecordStore::new());
        let k = completed(&store, "evt").await;
        let task =
            RetentionTask::new(store.clone(), Duration::from_secs(3600), Duration::from_secs(1));
        assert_eq!(task.sweep_once().await.unwrap(), 0);
        assert!(store.get(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_with_zero_retention_purges() {
        let store = Arc::new(MemRecordStore::new());
        let k = completed(&store, "evt").await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let task = RetentionTask::new(store.clone(), Duration::ZERO, Duration::from_secs(1));
        assert_eq!(task.sweep_once().await.unwrap(), 1);
        assert!(store.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemRecordStore::new());
        completed(&store, "evt").await;
        let task = RetentionTask::new(store.clone(), Duration::ZERO, Duration::from_millis(5));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(task.run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(store.is_empty().await);
    }
}
