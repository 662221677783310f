use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::{BrokerChannel, BrokerConnector, DeliveryStream};
use crate::config::BrokerConfig;
use crate::core::{ArgValue, Delivery, ExchangeKind, QueueOptions, RelayError};

const REPLY_SUCCESS: u16 = 200;

/// Connects to an AMQP 0-9-1 broker through lapin.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn open(&self, config: &BrokerConfig) -> Result<Box<dyn BrokerChannel>, RelayError> {
        let uri = amqp_uri(config);
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| RelayError::Connection(format!("Failed to connect to {}:{}: {e}", config.host, config.port)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(RelayError::Connection(format!("Failed to create channel: {e}")));
            }
        };

        info!(host = %config.host, port = config.port, vhost = %config.virtual_host, "Connected to broker");
        Ok(Box::new(AmqpChannel { connection, channel }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), RelayError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to declare exchange {name}: {e}")))
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<String, RelayError> {
        let queue = self
            .channel
            .queue_declare(
                &options.name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                field_table(options),
            )
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to declare queue '{}': {e}", options.name)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), RelayError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to bind '{routing_key}' on {queue}: {e}")))
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), RelayError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to unbind '{routing_key}' from {queue}: {e}")))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, RelayError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to consume from {queue}: {e}")))?;

        let stream = consumer.map(|item| {
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                payload: Bytes::from(delivery.data),
            })
            .map_err(|e| RelayError::Interrupted(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), RelayError> {
        // Fire and forget: the publisher confirm is never awaited.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to publish to '{routing_key}': {e}")))?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RelayError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RelayError::Protocol(format!("Failed to ack delivery {delivery_tag}: {e}")))
    }

    async fn close(&self) -> Result<(), RelayError> {
        let channel_result = self.channel.close(REPLY_SUCCESS, "Bye").await;
        let connection_result = self.connection.close(REPLY_SUCCESS, "Bye").await;
        debug!("Closed broker channel and connection");
        channel_result.map_err(|e| RelayError::Connection(format!("Failed to close channel: {e}")))?;
        connection_result.map_err(|e| RelayError::Connection(format!("Failed to close connection: {e}")))
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn field_table(options: &QueueOptions) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in &options.arguments {
        let value = match value {
            ArgValue::Bool(b) => AMQPValue::Boolean(*b),
            ArgValue::Int(i) => AMQPValue::LongLongInt(*i),
            ArgValue::Text(s) => AMQPValue::LongString(LongString::from(s.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

/// Credentials and vhost are percent-encoded, so the default vhost "/" becomes "%2F".
pub(crate) fn amqp_uri(config: &BrokerConfig) -> String {
    format!(
        "amqp://{}:{}@{}:{}/{}",
        urlencoding::encode(&config.username),
        urlencoding::encode(&config.password),
        config.host,
        config.port,
        urlencoding::encode(&config.virtual_host),
    )
}
