//! Background RabbitMQ consumer.
//!
//! The consumer owns one channel for its whole lifetime, limits the number of
//! unacknowledged deliveries with a prefetch count, and handles deliveries one
//! at a time:
//!
//! ```text
//! Idle → Connecting → Consuming → (Faulted | ShuttingDown) → Stopped
//! ```
//!
//! Every delivery gets exactly one ack (handler succeeded) or one nack with
//! requeue (handler failed or panicked). If the broker cannot be reached at
//! startup, a single warning is logged and the consumer stops without
//! retrying.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityLogger, LogEntry, Severity, TARGET_RABBITMQ};
use crate::broker::{
    close_quietly, AmqpConnector, BrokerChannel, BrokerConnection, BrokerError, ChannelOf,
    ConnectionManager, Connector, Delivery,
};
use crate::config::BrokerConfig;
use crate::queue::QUEUE_OPTIONS;

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Consuming,
    Faulted,
    ShuttingDown,
    Stopped,
}

/// Why [`Consumer::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The shutdown signal fired.
    Shutdown,
    /// The broker ended the delivery stream.
    StreamClosed,
    /// No connection could be established at startup.
    BrokerUnavailable(BrokerError),
    /// Connected, but the channel, QoS, queue or consumer could not be set up.
    SetupFailed(BrokerError),
}

/// Error returned by a [`DeliveryHandler`]; the delivery is requeued.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to decode message body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Processes a single delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Decodes each body as JSON and logs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHandler;

#[async_trait]
impl DeliveryHandler for JsonHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let message: serde_json::Value = serde_json::from_slice(&delivery.data)?;
        info!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            message = %message,
            "consumer_message_received"
        );
        Ok(())
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub queue: String,
    pub prefetch_count: u16,
    pub consumer_tag: String,
}

impl From<&BrokerConfig> for ConsumerSettings {
    fn from(config: &BrokerConfig) -> Self {
        ConsumerSettings {
            queue: config.queue.clone(),
            prefetch_count: config.prefetch_count,
            consumer_tag: "rigforge-worker".to_string(),
        }
    }
}

/// Long-running queue consumer.
pub struct Consumer<H, C: Connector = AmqpConnector> {
    connections: Arc<ConnectionManager<C>>,
    logger: Arc<ActivityLogger>,
    handler: H,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
}

impl<H, C> Consumer<H, C>
where
    H: DeliveryHandler,
    C: Connector,
{
    pub fn new(
        connections: Arc<ConnectionManager<C>>,
        logger: Arc<ActivityLogger>,
        handler: H,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            connections,
            logger,
            handler,
            settings,
            state,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` resolves or the consumer cannot continue.
    ///
    /// The channel opened here is closed on every return path.
    pub async fn run<F>(&self, shutdown: F) -> ConsumerExit
    where
        F: Future<Output = ()> + Send,
    {
        self.transition(ConsumerState::Connecting);

        let conn = match self.connections.get().await {
            Ok(conn) => conn,
            Err(e) => {
                let entry = LogEntry::system(
                    "ConsumerStartup",
                    TARGET_RABBITMQ,
                    &self.settings.queue,
                    Severity::Warning,
                )
                .with_description(format!(
                    "RabbitMQ unavailable, skipping consumer startup: {e}"
                ));
                self.logger.log(entry).await;
                return self.fault(ConsumerExit::BrokerUnavailable(e));
            }
        };

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(e) => return self.setup_failed(e).await,
        };

        let exit = self.consume(&channel, shutdown).await;
        close_quietly(&channel, "consumer").await;

        if matches!(exit, ConsumerExit::SetupFailed(_)) {
            self.transition(ConsumerState::Faulted);
        }
        self.transition(ConsumerState::Stopped);
        info!(queue = %self.settings.queue, exit = ?exit, "consumer_stopped");
        exit
    }

    async fn consume<F>(&self, channel: &ChannelOf<C>, shutdown: F) -> ConsumerExit
    where
        F: Future<Output = ()> + Send,
    {
        let mut deliveries = match self.prepare(channel).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.log_setup_failure(&e).await;
                return ConsumerExit::SetupFailed(e);
            }
        };

        self.transition(ConsumerState::Consuming);
        info!(
            queue = %self.settings.queue,
            prefetch_count = self.settings.prefetch_count,
            "consumer_started"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.transition(ConsumerState::ShuttingDown);
                    info!(queue = %self.settings.queue, "consumer_stopping");
                    return ConsumerExit::Shutdown;
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.dispatch(channel, delivery).await,
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!(queue = %self.settings.queue, "rabbitmq_consumer_closed");
                            return ConsumerExit::StreamClosed;
                        }
                    }
                }
            }
        }
    }

    async fn prepare(
        &self,
        channel: &ChannelOf<C>,
    ) -> Result<<ChannelOf<C> as BrokerChannel>::Deliveries, BrokerError> {
        channel.basic_qos(self.settings.prefetch_count).await?;
        channel.queue_declare(&self.settings.queue, QUEUE_OPTIONS).await?;
        channel
            .basic_consume(&self.settings.queue, &self.settings.consumer_tag)
            .await
    }

    /// Run the handler for one delivery and settle it exactly once.
    async fn dispatch(&self, channel: &ChannelOf<C>, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        debug!(
            delivery_tag = delivery_tag,
            body_length = delivery.data.len(),
            "consumer_delivery_received"
        );

        let outcome = AssertUnwindSafe(self.handler.handle(&delivery))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("handler panicked".to_string()),
        };

        match failure {
            None => match channel.basic_ack(delivery_tag).await {
                Ok(()) => debug!(delivery_tag = delivery_tag, "consumer_delivery_acked"),
                Err(e) => error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed"),
            },
            Some(reason) => {
                if let Err(e) = channel.basic_nack(delivery_tag, true).await {
                    error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
                }
                // Requeued poison messages come straight back; only their
                // first failure goes to the activity log.
                if delivery.redelivered {
                    warn!(
                        delivery_tag = delivery_tag,
                        reason = %reason,
                        "consumer_redelivery_failed"
                    );
                    return;
                }
                let entry = LogEntry::system(
                    "Consume",
                    TARGET_RABBITMQ,
                    &self.settings.queue,
                    Severity::Error,
                )
                .with_description(format!(
                    "Failed to handle delivery {delivery_tag}, requeued: {reason}"
                ));
                self.logger.log(entry).await;
            }
        }
    }

    async fn setup_failed(&self, e: BrokerError) -> ConsumerExit {
        self.log_setup_failure(&e).await;
        self.fault(ConsumerExit::SetupFailed(e))
    }

    async fn log_setup_failure(&self, e: &BrokerError) {
        let entry = LogEntry::system(
            "ConsumerStartup",
            TARGET_RABBITMQ,
            &self.settings.queue,
            Severity::Error,
        )
        .with_description(format!("Consumer setup failed: {e}"));
        self.logger.log(entry).await;
    }

    fn fault(&self, exit: ConsumerExit) -> ConsumerExit {
        self.transition(ConsumerState::Faulted);
        self.transition(ConsumerState::Stopped);
        exit
    }

    fn transition(&self, next: ConsumerState) {
        self.state.send_replace(next);
        debug!(state = ?next, "consumer_state_changed");
    }
}
