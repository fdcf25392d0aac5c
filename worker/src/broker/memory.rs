//! In-process broker implementing the transport traits.
//!
//! Behaves like a single RabbitMQ node reached through the default exchange:
//! publishing to a declared queue either hands the message to the queue's
//! consumer or parks it until one registers. Every interaction is recorded so
//! tests can assert on connection attempts, declarations, acks and nacks.
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let manager = ConnectionManager::new(broker.clone());
//! broker.set_reachable(false); // next connect() fails
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;

use super::{BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, QueueOptions};

/// A cloneable handle to one in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: AtomicBool,
    connections_dropped: AtomicBool,
    connect_delay_ms: AtomicU64,
    connect_attempts: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    next_delivery_tag: AtomicU64,
    inner: Mutex<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, QueueState>,
    published: Vec<(String, Vec<u8>)>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    prefetch: Option<u16>,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<(Vec<u8>, bool)>,
    consumer: Option<(u64, mpsc::UnboundedSender<Result<Delivery, BrokerError>>)>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delay every connection attempt, widening the window for racing callers.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Mark every connection handed out so far as closed.
    pub fn drop_connections(&self) {
        self.state.connections_dropped.store(true, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> usize {
        self.state.channels_closed.load(Ordering::SeqCst)
    }

    /// Options a queue was declared with, if it has been declared.
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.lock().queues.get(queue).map(|q| q.options)
    }

    /// Bodies published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Number of messages waiting in `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    /// Delivery tags handed to consumers that are still awaiting ack or nack.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Last prefetch limit set through `basic_qos`.
    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.state.lock()
    }
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a message to the queue's consumer, or park it if there is none.
    fn route(&self, inner: &mut BrokerInner, queue: &str, body: Vec<u8>, redelivered: bool) {
        let Some(state) = inner.queues.get_mut(queue) else {
            // The default exchange drops messages for undeclared queues.
            return;
        };

        if let Some((_, sender)) = &state.consumer {
            let tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                data: body.clone(),
                redelivered,
            };
            if sender.unbounded_send(Ok(delivery)).is_ok() {
                inner.unacked.insert(tag, (queue.to_string(), body));
                return;
            }
            state.consumer = None;
        }

        state.ready.push_back((body, redelivered));
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BrokerError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }
        let id = self.state.channels_opened.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        Ok(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.state.connections_dropped.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Deliveries = mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>;

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        match inner.queues.get(queue) {
            Some(existing) if existing.options != options => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{queue}'"
            ))),
            Some(_) => Ok(()),
            None => {
                inner.queues.insert(
                    queue.to_string(),
                    QueueState {
                        options,
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.lock().prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn basic_publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        inner.published.push((queue.to_string(), body.to_vec()));
        self.state.route(&mut inner, queue, body.to_vec(), false);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Self::Deliveries, BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        let (sender, receiver) = mpsc::unbounded();

        let parked = match inner.queues.get_mut(queue) {
            Some(state) => {
                state.consumer = Some((self.id, sender));
                std::mem::take(&mut state.ready)
            }
            None => {
                return Err(BrokerError::Channel(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )))
            }
        };

        for (body, redelivered) in parked {
            self.state.route(&mut inner, queue, body, redelivered);
        }

        Ok(receiver)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        if inner.unacked.remove(&delivery_tag).is_none() {
            return Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }
        inner.acked.push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut inner = self.state.lock();
        let Some((queue, body)) = inner.unacked.remove(&delivery_tag) else {
            return Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        inner.nacked.push((delivery_tag, requeue));
        if requeue {
            // Requeued messages wait for the next consumer instead of looping
            // straight back to the one that rejected them.
            if let Some(state) = inner.queues.get_mut(&queue) {
                state.ready.push_back((body, true));
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.channels_closed.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.state.lock();
        for state in inner.queues.values_mut() {
            if matches!(&state.consumer, Some((owner, _)) if *owner == self.id) {
                state.consumer = None;
            }
        }
        Ok(())
    }
}
