//! Shared, lazily established broker connection.
//!
//! One [`ConnectionManager`] is created at startup and handed to the
//! publisher, the consumer and the broker health probe. The first caller of
//! [`ConnectionManager::get`] starts the connection attempt; anyone arriving
//! while it is in flight awaits the same attempt instead of opening a second
//! physical connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

use super::{BrokerConnection, BrokerError, ConnectionOf, Connector};

type Attempt<T> = Shared<BoxFuture<'static, Result<Arc<T>, BrokerError>>>;

/// Owns the single connection to the broker.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    slot: Mutex<Option<Attempt<ConnectionOf<C>>>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            slot: Mutex::new(None),
        }
    }

    /// Return the shared connection, establishing it on first use.
    ///
    /// A failed attempt is reported to every caller that awaited it and is
    /// then forgotten, so the next call starts a fresh attempt. There is no
    /// retry inside the manager.
    pub async fn get(&self) -> Result<Arc<ConnectionOf<C>>, BrokerError> {
        let attempt = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let connector = Arc::clone(&self.connector);
                    let attempt = async move { connector.connect().await.map(Arc::new) }
                        .boxed()
                        .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        match attempt.clone().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut slot = self.lock();
                if slot.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
                    *slot = None;
                }
                warn!(error = %e, "rabbitmq_connection_failed");
                Err(e)
            }
        }
    }

    /// Whether a connection has been established and still reports open.
    pub fn is_connected(&self) -> bool {
        self.resolved().is_some_and(|conn| conn.is_open())
    }

    /// Forget the cached connection or in-flight attempt without closing it.
    pub fn reset(&self) {
        self.lock().take();
    }

    /// Close the cached connection, if one was established.
    pub async fn close(&self) {
        let conn = self.resolved();
        self.reset();

        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
            info!("rabbitmq_connection_closed");
        }
    }

    fn resolved(&self) -> Option<Arc<ConnectionOf<C>>> {
        self.lock()
            .as_ref()
            .and_then(|attempt| attempt.peek())
            .and_then(|result| result.as_ref().ok())
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Attempt<ConnectionOf<C>>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(50));
        let manager = Arc::new(ConnectionManager::new(broker.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get().await })
            })
            .collect();

        let mut connections = Vec::new();
        for handle in handles {
            connections.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(broker.connect_attempts(), 1);
        assert!(connections
            .iter()
            .all(|conn| Arc::ptr_eq(conn, &connections[0])));
    }

    #[tokio::test]
    async fn test_resolved_connection_is_reused() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone());

        let first = manager.get().await.unwrap();
        let second = manager.get().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_attempts(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_next_call_retries() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        broker.set_connect_delay(Duration::from_millis(30));
        let manager = Arc::new(ConnectionManager::new(broker.clone()));

        let a = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.get().await }
        });
        let b = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.get().await }
        });

        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert_eq!(broker.connect_attempts(), 1);
        assert!(!manager.is_connected());

        broker.set_reachable(true);
        assert!(manager.get().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_reset_forces_new_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone());

        let first = manager.get().await.unwrap();
        manager.reset();
        let second = manager.get().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_closes_cached_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone());

        let conn = manager.get().await.unwrap();
        manager.close().await;

        assert!(!conn.is_open());
        assert!(!manager.is_connected());
    }
}
