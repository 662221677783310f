use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::dispatch::Dispatcher;
use super::{Command, DeliveryCallback, RelayState};
use crate::broker::{BrokerChannel, BrokerConnector, DeliveryStream};
use crate::config::RelayConfig;
use crate::core::{Delivery, ExchangeKind, QueueOptions, RelayError};

struct Session {
    channel: Box<dyn BrokerChannel>,
    queue: String,
    bindings: BTreeSet<String>,
}

enum Event {
    Command(Option<Command>),
    Delivery(Option<Result<Delivery, RelayError>>),
}

/// Sole owner of the broker channel. Every relay operation reaches it as a [`Command`],
/// so setup, acknowledgement and teardown never race each other.
pub(crate) struct RelayActor {
    config: RelayConfig,
    connector: Arc<dyn BrokerConnector>,
    dispatcher: Arc<dyn Dispatcher>,
    state: watch::Sender<RelayState>,
    session: Option<Session>,
    deliveries: Option<DeliveryStream>,
    callback: Option<DeliveryCallback>,
    last_delivery: Option<Bytes>,
}

impl RelayActor {
    pub(crate) fn new(
        config: RelayConfig,
        connector: Arc<dyn BrokerConnector>,
        dispatcher: Arc<dyn Dispatcher>,
        state: watch::Sender<RelayState>,
    ) -> Self {
        Self {
            config,
            connector,
            dispatcher,
            state,
            session: None,
            deliveries: None,
            callback: None,
            last_delivery: None,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            // The command channel is also the cancellation signal: dispose or dropping
            // the handle wakes this wait even when no delivery ever arrives.
            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                item = next_delivery(&mut self.deliveries) => Event::Delivery(item),
            };

            match event {
                Event::Command(Some(command)) => self.handle(command).await,
                Event::Command(None) => {
                    debug!("Relay handle dropped, shutting down");
                    self.teardown().await;
                    self.state.send_replace(RelayState::Stopped);
                    break;
                }
                Event::Delivery(Some(Ok(delivery))) => self.on_delivery(delivery).await,
                Event::Delivery(Some(Err(e))) => {
                    warn!(error = %e, "Delivery wait interrupted, waiting again");
                }
                Event::Delivery(None) => self.on_stream_end().await,
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { queue, reply } => {
                let _ = reply.send(self.connect(queue).await);
            }
            Command::AddBinding { routing_key, reply } => {
                let _ = reply.send(self.add_binding(routing_key).await);
            }
            Command::RemoveBinding { routing_key, reply } => {
                let _ = reply.send(self.remove_binding(&routing_key).await);
            }
            Command::SetCallback { callback } => {
                if callback.is_some() && self.callback.is_some() {
                    debug!("Replacing delivery callback");
                }
                self.callback = callback;
            }
            Command::Publish {
                routing_key,
                payload,
                reply,
            } => {
                let _ = reply.send(self.publish(&routing_key, &payload).await);
            }
            Command::LastDelivery { reply } => {
                let _ = reply.send(self.last_delivery.clone());
            }
            Command::Dispose { reply } => {
                self.teardown().await;
                self.state.send_replace(RelayState::Stopped);
                let _ = reply.send(());
            }
        }
    }

    #[instrument(skip(self), fields(exchange = %self.config.broker.exchange))]
    async fn connect(&mut self, options: QueueOptions) -> Result<String, RelayError> {
        if let Some(session) = &self.session {
            debug!(queue = %session.queue, "Already connected");
            return Ok(session.queue.clone());
        }

        let previous = self.state.borrow().clone();
        let channel = match self.connector.open(&self.config.broker).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Failed to open broker connection");
                return Err(e);
            }
        };

        match self.establish(channel.as_ref(), &options).await {
            Ok((queue, bindings, stream)) => {
                info!(queue = %queue, "Relay consuming");
                self.session = Some(Session {
                    channel,
                    queue: queue.clone(),
                    bindings,
                });
                self.deliveries = Some(stream);
                self.state.send_replace(RelayState::Consuming { queue: queue.clone() });
                Ok(queue)
            }
            Err(e) => {
                warn!(error = %e, "Relay setup failed, closing partial session");
                if let Err(close_err) = channel.close().await {
                    warn!(error = %close_err, "Failed to close partial session");
                }
                self.state.send_replace(previous);
                Err(e)
            }
        }
    }

    async fn establish(
        &mut self,
        channel: &dyn BrokerChannel,
        options: &QueueOptions,
    ) -> Result<(String, BTreeSet<String>, DeliveryStream), RelayError> {
        let broker = &self.config.broker;
        channel
            .declare_exchange(&broker.exchange, broker.exchange_kind, broker.exchange_durable)
            .await?;
        let queue = channel.declare_queue(options).await?;

        let mut bindings = BTreeSet::new();
        if broker.exchange_kind == ExchangeKind::Fanout {
            channel.bind_queue(&queue, &broker.exchange, "").await?;
            bindings.insert(String::new());
        }
        self.state.send_replace(RelayState::Connected { queue: queue.clone() });

        let consumer_tag = format!("{}-{}", self.config.consumer_tag_prefix, Uuid::new_v4().simple());
        let stream = channel.consume(&queue, &consumer_tag).await?;
        Ok((queue, bindings, stream))
    }

    async fn add_binding(&mut self, routing_key: String) -> Result<(), RelayError> {
        let Some(session) = self.session.as_mut() else {
            warn!(routing_key = %routing_key, "Cannot bind, relay is not connected");
            return Err(RelayError::NotConnected);
        };
        if session.bindings.contains(&routing_key) {
            return Ok(());
        }

        session
            .channel
            .bind_queue(&session.queue, &self.config.broker.exchange, &routing_key)
            .await
            .inspect_err(|e| warn!(routing_key = %routing_key, error = %e, "Failed to add binding"))?;
        debug!(queue = %session.queue, routing_key = %routing_key, "Binding added");
        session.bindings.insert(routing_key);
        Ok(())
    }

    async fn remove_binding(&mut self, routing_key: &str) -> Result<(), RelayError> {
        let Some(session) = self.session.as_mut() else {
            warn!(routing_key = %routing_key, "Cannot unbind, relay is not connected");
            return Err(RelayError::NotConnected);
        };

        session
            .channel
            .unbind_queue(&session.queue, &self.config.broker.exchange, routing_key)
            .await
            .inspect_err(|e| warn!(routing_key = %routing_key, error = %e, "Failed to remove binding"))?;
        debug!(queue = %session.queue, routing_key = %routing_key, "Binding removed");
        session.bindings.remove(routing_key);
        Ok(())
    }

    async fn publish(&mut self, routing_key: &str, payload: &[u8]) -> Result<bool, RelayError> {
        let Some(session) = &self.session else {
            debug!(routing_key = %routing_key, "Not connected, publish skipped");
            return Ok(false);
        };

        session
            .channel
            .publish(&self.config.broker.exchange, routing_key, payload)
            .await
            .inspect_err(|e| warn!(routing_key = %routing_key, error = %e, "Publish failed"))?;
        Ok(true)
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        self.last_delivery = Some(delivery.payload.clone());

        match &self.callback {
            Some(callback) => {
                let callback = callback.clone();
                self.dispatcher.dispatch(Box::new(move || callback(delivery)));
            }
            None => debug!(delivery_tag, "No delivery callback registered"),
        }

        if let Some(session) = &self.session {
            if let Err(e) = session.channel.ack(delivery_tag).await {
                warn!(delivery_tag, error = %e, "Failed to acknowledge delivery");
            }
        }
    }

    async fn on_stream_end(&mut self) {
        warn!("Broker closed the consumer, relay disconnected");
        self.deliveries = None;
        if let Some(session) = self.session.take() {
            if let Err(e) = session.channel.close().await {
                debug!(error = %e, "Closing dropped session failed");
            }
        }
        self.state.send_replace(RelayState::Disconnected {
            reason: "consumer stream closed by broker".to_string(),
        });
    }

    async fn teardown(&mut self) {
        self.deliveries = None;
        if let Some(session) = self.session.take() {
            match session.channel.close().await {
                Ok(()) => info!(queue = %session.queue, "Relay disposed"),
                Err(e) => warn!(queue = %session.queue, error = %e, "Error while closing broker session"),
            }
        }
    }
}

async fn next_delivery(deliveries: &mut Option<DeliveryStream>) -> Option<Result<Delivery, RelayError>> {
    match deliveries {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
