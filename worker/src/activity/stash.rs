//! In-memory buffer for entries the primary store could not take.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use super::entry::LogEntry;
use super::store::{LogStore, StoreError};

/// Unbounded, insertion-ordered queue of pending log entries.
///
/// Any number of tasks may push concurrently. Draining is serialized by a
/// separate async lock, and only the drainer removes entries, so the entry at
/// the front stays put while it is being written out.
#[derive(Default)]
pub struct LogStash {
    entries: Mutex<VecDeque<LogEntry>>,
    drain_lock: AsyncMutex<()>,
}

impl LogStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: LogEntry) {
        self.lock().push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the pending entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Write pending entries to `store` oldest first, removing each one only
    /// after it was saved.
    ///
    /// Stops at the first failure and returns it together with the number of
    /// entries already written; those stay removed and the rest stay stashed.
    pub async fn drain_into(&self, store: &dyn LogStore) -> Result<usize, (usize, StoreError)> {
        let _guard = self.drain_lock.lock().await;
        self.drain_locked(store, usize::MAX).await
    }

    /// Write at most `limit` pending entries, returning `None` straight away
    /// if another drain is already running.
    pub async fn try_drain_into(
        &self,
        store: &dyn LogStore,
        limit: usize,
    ) -> Option<Result<usize, (usize, StoreError)>> {
        let _guard = self.drain_lock.try_lock().ok()?;
        Some(self.drain_locked(store, limit).await)
    }

    async fn drain_locked(
        &self,
        store: &dyn LogStore,
        limit: usize,
    ) -> Result<usize, (usize, StoreError)> {
        let mut written = 0;
        while written < limit {
            let next = self.lock().front().cloned();
            let Some(entry) = next else {
                return Ok(written);
            };

            if let Err(e) = store.save(&entry).await {
                return Err((written, e));
            }

            self.lock().pop_front();
            written += 1;
        }
        Ok(written)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::entry::Severity;
    use crate::activity::store::MemoryLogStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    /// Store that takes a while for every save.
    #[derive(Default)]
    struct SlowStore {
        saved: Mutex<Vec<LogEntry>>,
    }

    impl SlowStore {
        fn ids(&self) -> Vec<String> {
            let saved = self.saved.lock().unwrap();
            saved.iter().map(|e| e.target_id.clone()).collect()
        }
    }

    #[async_trait]
    impl LogStore for SlowStore {
        async fn save(&self, entry: &LogEntry) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.saved.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn entry(target_id: &str) -> LogEntry {
        LogEntry::system("Publish", "RabbitMQ", target_id, Severity::Error)
    }

    #[tokio::test]
    async fn test_drain_preserves_insertion_order() {
        let stash = LogStash::new();
        let store = MemoryLogStore::new();
        for id in ["a", "b", "c"] {
            stash.push(entry(id));
        }

        assert_eq!(stash.drain_into(&store).await.unwrap(), 3);
        assert!(stash.is_empty());
        let ids: Vec<_> = store.entries().into_iter().map(|e| e.target_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_drain_into_unavailable_store_keeps_everything() {
        let stash = LogStash::new();
        let store = MemoryLogStore::new();
        store.set_available(false);
        stash.push(entry("a"));
        stash.push(entry("b"));

        let (written, _) = stash.drain_into(&store).await.unwrap_err();
        assert_eq!(written, 0);
        assert_eq!(stash.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_pushes_are_not_lost() {
        let stash = Arc::new(LogStash::new());

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let stash = Arc::clone(&stash);
                tokio::spawn(async move { stash.push(entry(&i.to_string())) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stash.len(), 50);
        let mut ids: Vec<u32> = stash
            .snapshot()
            .into_iter()
            .map(|e| e.target_id.parse().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..50u32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_bounded_drain_leaves_the_rest() {
        let stash = LogStash::new();
        let store = MemoryLogStore::new();
        for id in ["a", "b", "c", "d"] {
            stash.push(entry(id));
        }

        assert!(matches!(stash.try_drain_into(&store, 3).await, Some(Ok(3))));
        let left: Vec<_> = stash.snapshot().into_iter().map(|e| e.target_id).collect();
        assert_eq!(left, vec!["d"]);
    }

    #[tokio::test]
    async fn test_try_drain_skips_while_draining() {
        let stash = Arc::new(LogStash::new());
        let store = Arc::new(SlowStore::default());
        for i in 0..5 {
            stash.push(entry(&format!("old-{i}")));
        }

        let drain = {
            let stash = Arc::clone(&stash);
            let store = Arc::clone(&store);
            tokio::spawn(async move { stash.drain_into(store.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert!(stash.try_drain_into(store.as_ref(), 10).await.is_none());
        assert!(matches!(drain.await.unwrap(), Ok(5)));
    }

    #[tokio::test]
    async fn test_push_during_drain_is_written_exactly_once() {
        let stash = Arc::new(LogStash::new());
        let store = Arc::new(SlowStore::default());
        for i in 0..5 {
            stash.push(entry(&format!("old-{i}")));
        }

        let drain = {
            let stash = Arc::clone(&stash);
            let store = Arc::clone(&store);
            tokio::spawn(async move { stash.drain_into(store.as_ref()).await })
        };

        // Wait until the drain is past its first entry, then push from many
        // tasks while it is still running.
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("drain did not start");

        let pushes: Vec<_> = (0..20)
            .map(|i| {
                let stash = Arc::clone(&stash);
                tokio::spawn(async move { stash.push(entry(&format!("new-{i}"))) })
            })
            .collect();
        for push in pushes {
            push.await.unwrap();
        }

        assert!(drain.await.unwrap().is_ok());
        assert!(stash.drain_into(store.as_ref()).await.is_ok());

        assert!(stash.is_empty());
        let ids = store.ids();
        assert_eq!(ids.len(), 25);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 25);
        let expected_old: Vec<String> = (0..5).map(|i| format!("old-{i}")).collect();
        assert_eq!(ids[..5], expected_old[..]);
    }
}
