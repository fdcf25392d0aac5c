//! RabbitMQ reachability probe.

use std::sync::Arc;

use async_trait::async_trait;

use super::{HealthProbe, HealthReport};
use crate::broker::{AmqpConnector, BrokerConnection, ConnectionManager, Connector};

/// Healthy iff the shared broker connection reports itself open.
///
/// Goes through the [`ConnectionManager`], so it reuses the process-wide
/// connection (establishing it if nobody has yet) rather than opening its own.
pub struct BrokerProbe<C: Connector = AmqpConnector> {
    connections: Arc<ConnectionManager<C>>,
}

impl<C: Connector> BrokerProbe<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl<C: Connector> HealthProbe for BrokerProbe<C> {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn check(&self) -> HealthReport {
        match self.connections.get().await {
            Ok(conn) if conn.is_open() => HealthReport::healthy("RabbitMQ connection is open"),
            Ok(_) => HealthReport::unhealthy("RabbitMQ connection is closed", None),
            Err(e) => HealthReport::unhealthy("RabbitMQ is unreachable", Some(e.to_string())),
        }
    }
}
