//! RabbitMQ transport built on lapin.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::info;

use super::{BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, QueueOptions};
use crate::config::BrokerConfig;

/// Connects to RabbitMQ using host, port and credentials from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, BrokerError> {
        let url = self
            .config
            .amqp_url()
            .map_err(|e| BrokerError::Connection(format!("invalid broker address: {e}")))?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            "rabbitmq_connecting"
        );

        let conn = Connection::connect(url.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!("rabbitmq_connected");
        Ok(conn)
    }
}

#[async_trait]
impl BrokerConnection for Connection {
    type Channel = Channel;

    async fn create_channel(&self) -> Result<Channel, BrokerError> {
        Connection::create_channel(self)
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Connection::close(self, 200, "Normal shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

#[async_trait]
impl BrokerChannel for Channel {
    type Deliveries = BoxStream<'static, Result<Delivery, BrokerError>>;

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        Channel::queue_declare(
            self,
            queue,
            QueueDeclareOptions {
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
        .map_err(channel_error)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        Channel::basic_qos(self, prefetch_count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn basic_publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        // No confirm mode is enabled, so the returned confirmation is not awaited.
        Channel::basic_publish(
            self,
            "",
            queue,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default().with_content_type("application/json".into()),
        )
        .await
        .map(|_confirm| ())
        .map_err(channel_error)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Self::Deliveries, BrokerError> {
        let consumer = Channel::basic_consume(
            self,
            queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(channel_error)?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        delivery_tag: d.delivery_tag,
                        redelivered: d.redelivered,
                        data: d.data,
                    })
                    .map_err(|e| BrokerError::Delivery(e.to_string()))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        Channel::basic_ack(self, delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        Channel::basic_nack(
            self,
            delivery_tag,
            BasicNackOptions {
                requeue,
                ..Default::default()
            },
        )
        .await
        .map_err(channel_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Channel::close(self, 200, "Normal shutdown")
            .await
            .map_err(channel_error)
    }
}

fn channel_error(e: lapin::Error) -> BrokerError {
    BrokerError::Channel(e.to_string())
}
