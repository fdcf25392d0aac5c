//! Activity logger that never fails its caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::entry::{LogEntry, Severity};
use super::stash::LogStash;
use super::store::LogStore;

/// Upper bound on entries written by the flush that piggybacks on `log`.
const OPPORTUNISTIC_FLUSH_LIMIT: usize = 32;

/// Outcome of a stash flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries written to the store and removed from the stash
    pub flushed: usize,
    /// Entries still waiting in the stash
    pub remaining: usize,
}

/// Records activity entries to the primary store, stashing them when the
/// store is unavailable.
///
/// After [`log`](Self::log) returns, the entry is either in the store or in
/// the stash, never both and never neither.
pub struct ActivityLogger {
    store: Arc<dyn LogStore>,
    stash: LogStash,
}

impl ActivityLogger {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            stash: LogStash::new(),
        }
    }

    /// Persist `entry`, or stash it if the store rejects it.
    pub async fn log(&self, entry: LogEntry) {
        trace_entry(&entry);

        match self.store.save(&entry).await {
            Ok(()) => {
                if !self.stash.is_empty() {
                    self.flush_opportunistically().await;
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    activity_type = %entry.activity_type,
                    target_type = %entry.target_type,
                    "activity_log_stashed"
                );
                self.stash.push(entry);
            }
        }
    }

    /// Build an entry from its parts and [`log`](Self::log) it.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        user_id: &str,
        activity_type: &str,
        target_type: &str,
        ip_address: Option<&str>,
        target_id: &str,
        severity: Severity,
        description: Option<&str>,
    ) {
        let mut entry = LogEntry::new(user_id, activity_type, target_type, target_id, severity);
        entry.ip_address = ip_address.map(str::to_string);
        entry.description = description.map(str::to_string);
        self.log(entry).await;
    }

    /// Append `entry` to the stash without trying the store.
    pub fn stash(&self, entry: LogEntry) {
        self.stash.push(entry);
    }

    /// Write stashed entries to the store in insertion order.
    ///
    /// Best effort: stops at the first store failure, leaving that entry and
    /// everything after it stashed.
    pub async fn flush_stashed_logs(&self) -> FlushReport {
        let flushed = match self.stash.drain_into(self.store.as_ref()).await {
            Ok(flushed) => flushed,
            Err((flushed, e)) => {
                warn!(error = %e, flushed = flushed, "activity_stash_flush_interrupted");
                flushed
            }
        };

        let report = FlushReport {
            flushed,
            remaining: self.stash.len(),
        };
        if report.flushed > 0 {
            info!(
                flushed = report.flushed,
                remaining = report.remaining,
                "activity_stash_flushed"
            );
        }
        report
    }

    /// Number of entries waiting in the stash.
    pub fn stashed_len(&self) -> usize {
        self.stash.len()
    }

    /// Copy of the stashed entries, oldest first.
    pub fn stashed_entries(&self) -> Vec<LogEntry> {
        self.stash.snapshot()
    }

    async fn flush_opportunistically(&self) {
        let limit = OPPORTUNISTIC_FLUSH_LIMIT;
        match self.stash.try_drain_into(self.store.as_ref(), limit).await {
            Some(Ok(flushed)) => debug!(flushed = flushed, "activity_stash_flushed"),
            Some(Err((flushed, e))) => {
                debug!(error = %e, flushed = flushed, "activity_stash_flush_interrupted")
            }
            None => {}
        }
    }
}

/// Mirror an entry to tracing at its severity.
fn trace_entry(entry: &LogEntry) {
    let description = entry.description.as_deref().unwrap_or("");
    match entry.severity {
        Severity::Information => info!(
            user_id = %entry.user_id,
            activity_type = %entry.activity_type,
            target_type = %entry.target_type,
            target_id = %entry.target_id,
            description = description,
            "activity"
        ),
        Severity::Warning => warn!(
            user_id = %entry.user_id,
            activity_type = %entry.activity_type,
            target_type = %entry.target_type,
            target_id = %entry.target_id,
            description = description,
            "activity"
        ),
        Severity::Error | Severity::Critical => error!(
            user_id = %entry.user_id,
            activity_type = %entry.activity_type,
            target_type = %entry.target_type,
            target_id = %entry.target_id,
            severity = %entry.severity,
            description = description,
            "activity"
        ),
    }
}

/// Flush the stash every `interval` until `shutdown` resolves, then make one
/// last attempt.
pub async fn run_stash_flusher<F>(logger: Arc<ActivityLogger>, interval: Duration, shutdown: F)
where
    F: Future<Output = ()> + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(interval_secs = interval.as_secs(), "activity_stash_flusher_started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if logger.stashed_len() > 0 {
                    logger.flush_stashed_logs().await;
                }
            }
        }
    }

    let report = logger.flush_stashed_logs().await;
    if report.remaining > 0 {
        warn!(remaining = report.remaining, "activity_stash_not_empty_at_shutdown");
    }
    info!("activity_stash_flusher_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::store::{MemoryLogStore, StoreError};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn entry(target_id: &str) -> LogEntry {
        LogEntry::system("Publish", "RabbitMQ", target_id, Severity::Error)
    }

    fn ids(entries: Vec<LogEntry>) -> Vec<String> {
        entries.into_iter().map(|e| e.target_id).collect()
    }

    /// Store that rejects exactly one save call (1-based).
    struct FailOnCall {
        fail_on: usize,
        calls: AtomicUsize,
        saved: Mutex<Vec<LogEntry>>,
    }

    impl FailOnCall {
        fn new(fail_on: usize) -> Self {
            Self {
                fail_on,
                calls: AtomicUsize::new(0),
                saved: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LogStore for FailOnCall {
        async fn save(&self, entry: &LogEntry) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                return Err(StoreError::Unavailable("database timeout".to_string()));
            }
            self.saved.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    /// Store that sleeps before every save.
    #[derive(Default)]
    struct SlowStore {
        saved: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LogStore for SlowStore {
        async fn save(&self, entry: &LogEntry) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.saved.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_log_persists_when_store_available() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = ActivityLogger::new(store.clone());

        logger.log(entry("a")).await;

        assert_eq!(ids(store.entries()), vec!["a"]);
        assert_eq!(logger.stashed_len(), 0);
    }

    #[tokio::test]
    async fn test_log_stashes_when_store_fails() {
        let store = Arc::new(MemoryLogStore::new());
        store.set_available(false);
        let logger = ActivityLogger::new(store.clone());

        logger.log(entry("a")).await;

        assert!(store.entries().is_empty());
        assert_eq!(ids(logger.stashed_entries()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_stash_round_trip() {
        let store = Arc::new(MemoryLogStore::new());
        store.set_available(false);
        let logger = ActivityLogger::new(store.clone());

        for id in ["a", "b", "c"] {
            logger.log(entry(id)).await;
        }
        assert_eq!(logger.stashed_len(), 3);

        store.set_available(true);
        let report = logger.flush_stashed_logs().await;

        assert_eq!(report, FlushReport { flushed: 3, remaining: 0 });
        assert_eq!(ids(store.entries()), vec!["a", "b", "c"]);
        assert_eq!(logger.stashed_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_flush_keeps_remainder_in_order() {
        let store = Arc::new(FailOnCall::new(3));
        let logger = ActivityLogger::new(store.clone());
        for id in ["1", "2", "3", "4", "5"] {
            logger.stash(entry(id));
        }

        let report = logger.flush_stashed_logs().await;

        assert_eq!(report, FlushReport { flushed: 2, remaining: 3 });
        assert_eq!(ids(store.saved.lock().unwrap().clone()), vec!["1", "2"]);
        assert_eq!(ids(logger.stashed_entries()), vec!["3", "4", "5"]);

        // The store recovered after its single failure.
        let report = logger.flush_stashed_logs().await;
        assert_eq!(report, FlushReport { flushed: 3, remaining: 0 });
        assert_eq!(
            ids(store.saved.lock().unwrap().clone()),
            vec!["1", "2", "3", "4", "5"]
        );
    }

    #[tokio::test]
    async fn test_successful_log_flushes_stash_opportunistically() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = ActivityLogger::new(store.clone());
        logger.stash(entry("old"));

        logger.log(entry("new")).await;

        assert_eq!(logger.stashed_len(), 0);
        assert_eq!(ids(store.entries()), vec!["new", "old"]);
    }

    #[tokio::test]
    async fn test_opportunistic_flush_is_bounded() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = ActivityLogger::new(store.clone());
        for i in 0..100 {
            logger.stash(entry(&i.to_string()));
        }

        logger.log(entry("new")).await;

        assert_eq!(store.entries().len(), 1 + OPPORTUNISTIC_FLUSH_LIMIT);
        assert_eq!(logger.stashed_len(), 100 - OPPORTUNISTIC_FLUSH_LIMIT);
        assert_eq!(
            logger.stashed_entries()[0].target_id,
            OPPORTUNISTIC_FLUSH_LIMIT.to_string()
        );
    }

    #[tokio::test]
    async fn test_logging_during_flush_keeps_every_entry_once() {
        let store = Arc::new(SlowStore::default());
        let logger = Arc::new(ActivityLogger::new(store.clone()));
        for i in 0..5 {
            logger.stash(entry(&format!("old-{i}")));
        }

        let flush = {
            let logger = Arc::clone(&logger);
            tokio::spawn(async move { logger.flush_stashed_logs().await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;

        let writers: Vec<_> = (0..10)
            .map(|i| {
                let logger = Arc::clone(&logger);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        logger.stash(entry(&format!("stashed-{i}")));
                    } else {
                        logger.log(entry(&format!("logged-{i}"))).await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        flush.await.unwrap();
        logger.flush_stashed_logs().await;

        assert_eq!(logger.stashed_len(), 0);
        let saved = ids(store.saved.lock().unwrap().clone());
        assert_eq!(saved.len(), 15);
        assert_eq!(saved.iter().collect::<HashSet<_>>().len(), 15);
        let old: Vec<_> = saved.iter().filter(|id| id.starts_with("old-")).cloned().collect();
        assert_eq!(old, vec!["old-0", "old-1", "old-2", "old-3", "old-4"]);
    }

    #[tokio::test]
    async fn test_record_builds_entry() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = ActivityLogger::new(store.clone());

        logger
            .record(
                "17",
                "BuildCreated",
                "PcBuild",
                Some("192.168.1.4"),
                "b-9",
                Severity::Information,
                None,
            )
            .await;

        let saved = store.entries();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].user_id, "17");
        assert_eq!(saved[0].ip_address.as_deref(), Some("192.168.1.4"));
        assert_eq!(saved[0].description, None);
    }

    #[tokio::test]
    async fn test_concurrent_failing_logs_all_stashed() {
        let store = Arc::new(MemoryLogStore::new());
        store.set_available(false);
        let logger = Arc::new(ActivityLogger::new(store.clone()));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let logger = Arc::clone(&logger);
                tokio::spawn(async move { logger.log(entry(&i.to_string())).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(logger.stashed_len(), 20);
        store.set_available(true);
        logger.flush_stashed_logs().await;
        assert_eq!(store.entries().len(), 20);
        assert_eq!(logger.stashed_len(), 0);
    }

    #[tokio::test]
    async fn test_flusher_drains_on_shutdown() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = Arc::new(ActivityLogger::new(store.clone()));
        logger.stash(entry("a"));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(run_stash_flusher(
            Arc::clone(&logger),
            Duration::from_secs(3600),
            async move {
                let _ = rx.await;
            },
        ));
        tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(logger.stashed_len(), 0);
        assert_eq!(ids(store.entries()), vec!["a"]);
    }
}
