//! Broker transport abstraction.
//!
//! The publisher, consumer and broker health probe only talk to RabbitMQ
//! through the three traits defined here:
//!
//! ```text
//! Connector ──connect()──▶ BrokerConnection ──create_channel()──▶ BrokerChannel
//! ```
//!
//! [`amqp`] implements them on top of lapin; [`memory`] is an in-process
//! broker for tests.

pub mod amqp;
pub mod connection;
pub mod memory;

pub use amqp::AmqpConnector;
pub use connection::ConnectionManager;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Errors raised by the broker transport.
///
/// Cloneable so that a single shared connection attempt can hand the same
/// failure to every caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("channel operation failed: {0}")]
    Channel(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Non-durable, non-exclusive, no auto-delete.
    ///
    /// Messages on these queues do not survive a broker restart.
    pub const fn transient() -> Self {
        QueueOptions {
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery exactly once
    pub delivery_tag: u64,
    /// Raw message body (UTF-8 JSON on the wire)
    pub data: Vec<u8>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

/// Opens physical connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self) -> Result<Self::Connection, BrokerError>;
}

/// A live broker connection. Shared read-only between callers.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Whether the connection still reports itself as open.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel owned by exactly one operation.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    type Deliveries: Stream<Item = Result<Delivery, BrokerError>> + Send + Unpin + 'static;

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Limit the number of unacknowledged deliveries held by this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Publish `body` to `queue` through the default exchange.
    async fn basic_publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Self::Deliveries, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Connection type produced by a connector.
pub type ConnectionOf<C> = <C as Connector>::Connection;

/// Channel type produced by a connector's connections.
pub type ChannelOf<C> = <ConnectionOf<C> as BrokerConnection>::Channel;

/// Close a channel, logging and discarding any close-time error.
pub(crate) async fn close_quietly<Ch: BrokerChannel>(channel: &Ch, owner: &'static str) {
    if let Err(e) = channel.close().await {
        tracing::debug!(owner = owner, error = %e, "rabbitmq_channel_close_error");
    }
}
