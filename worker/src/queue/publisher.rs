//! Fire-and-forget RabbitMQ publisher.
//!
//! Each publish opens its own channel on the shared connection, declares the
//! target queue and sends one JSON message. Failures never reach the caller:
//! they are recorded as an ERROR activity entry instead.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::types::QUEUE_OPTIONS;
use crate::activity::{ActivityLogger, LogEntry, Severity, TARGET_RABBITMQ};
use crate::broker::{
    close_quietly, AmqpConnector, BrokerChannel, BrokerConnection, BrokerError, ConnectionManager,
    Connector,
};

/// Why a publish did not reach the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publishes typed messages through the shared broker connection.
pub struct Publisher<C: Connector = AmqpConnector> {
    connections: Arc<ConnectionManager<C>>,
    logger: Arc<ActivityLogger>,
}

impl<C: Connector> Clone for Publisher<C> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            logger: Arc::clone(&self.logger),
        }
    }
}

impl<C: Connector> Publisher<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>, logger: Arc<ActivityLogger>) -> Self {
        Self {
            connections,
            logger,
        }
    }

    /// Publish `message` as JSON to `queue`.
    ///
    /// Best effort and at most once: no publisher confirms are requested.
    /// Any failure is logged with ERROR severity and swallowed.
    pub async fn publish<T>(&self, queue: &str, message: &T)
    where
        T: Serialize + ?Sized + Sync,
    {
        match self.try_publish(queue, message).await {
            Ok(body_length) => {
                info!(queue = queue, body_length = body_length, "rabbitmq_message_published");
            }
            Err(e) => {
                let entry = LogEntry::system("Publish", TARGET_RABBITMQ, queue, Severity::Error)
                    .with_description(format!("Failed to publish message to '{queue}': {e}"));
                self.logger.log(entry).await;
            }
        }
    }

    async fn try_publish<T>(&self, queue: &str, message: &T) -> Result<usize, PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let conn = self.connections.get().await?;
        let channel = conn.create_channel().await?;

        let result = publish_on(&channel, queue, message).await;
        close_quietly(&channel, "publisher").await;
        result
    }
}

async fn publish_on<Ch, T>(channel: &Ch, queue: &str, message: &T) -> Result<usize, PublishError>
where
    Ch: BrokerChannel,
    T: Serialize + ?Sized + Sync,
{
    channel.queue_declare(queue, QUEUE_OPTIONS).await?;
    let body = serde_json::to_vec(message)?;
    channel.basic_publish(queue, &body).await?;
    Ok(body.len())
}
