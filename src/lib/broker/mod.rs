pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::{FailPoint, MemoryBroker};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::BrokerConfig;
use crate::core::{Delivery, ExchangeKind, QueueOptions, RelayError};

pub type DeliveryStream = BoxStream<'static, Result<Delivery, RelayError>>;

/// Opens sessions to a broker. One call yields one connection with one channel.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self, config: &BrokerConfig) -> Result<Box<dyn BrokerChannel>, RelayError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), RelayError>;
    /// Returns the queue name, which the broker picks when `options.name` is empty.
    async fn declare_queue(&self, options: &QueueOptions) -> Result<String, RelayError>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), RelayError>;
    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), RelayError>;
    /// Starts a manual-ack consumer. The stream ends when the broker drops the consumer.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, RelayError>;
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), RelayError>;
    async fn ack(&self, delivery_tag: u64) -> Result<(), RelayError>;
    async fn close(&self) -> Result<(), RelayError>;
}
