//! Broker-backed message relay.
//!
//! A [`MessageRelay`] is a cheap handle onto a background task that owns one broker
//! connection, one queue and its routing-key bindings. Deliveries are handed to the
//! registered callback through a [`Dispatcher`] and acknowledged once dispatched.

mod actor;
pub mod dispatch;

pub use dispatch::{dispatch_queue, DispatchQueue, Dispatcher, InlineDispatcher, QueueDispatcher};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::broker::BrokerConnector;
use crate::config::RelayConfig;
use crate::core::{Delivery, QueueOptions, RelayError};
use actor::RelayActor;

pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Lifecycle of a relay: `Idle → Connected → Consuming → (Disconnected | Stopped)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Connected { queue: String },
    Consuming { queue: String },
    Disconnected { reason: String },
    Stopped,
}

pub(crate) enum Command {
    Connect {
        queue: QueueOptions,
        reply: oneshot::Sender<Result<String, RelayError>>,
    },
    AddBinding {
        routing_key: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    RemoveBinding {
        routing_key: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    SetCallback {
        callback: Option<DeliveryCallback>,
    },
    Publish {
        routing_key: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<bool, RelayError>>,
    },
    LastDelivery {
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

pub struct MessageRelay {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RelayState>,
}

impl MessageRelay {
    /// Spawns the relay task on the current tokio runtime. The relay starts `Idle`.
    pub fn spawn(
        config: RelayConfig,
        connector: Arc<dyn BrokerConnector>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state) = watch::channel(RelayState::Idle);
        let actor = RelayActor::new(config, connector, dispatcher, state_tx);
        tokio::spawn(actor.run(receiver));
        Self { commands, state }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RelayError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RelayError::Stopped)?;
        response.await.map_err(|_| RelayError::Stopped)
    }

    /// Declares the exchange and queue and starts consuming. Returns the queue name.
    /// Calling it while already consuming returns the current queue without touching
    /// the broker; a failed attempt leaves nothing half-open.
    pub async fn connect(&self, queue: QueueOptions) -> Result<String, RelayError> {
        self.request(|reply| Command::Connect { queue, reply }).await?
    }

    pub async fn add_binding(&self, routing_key: impl Into<String>) -> Result<(), RelayError> {
        let routing_key = routing_key.into();
        self.request(|reply| Command::AddBinding { routing_key, reply }).await?
    }

    pub async fn remove_binding(&self, routing_key: impl Into<String>) -> Result<(), RelayError> {
        let routing_key = routing_key.into();
        self.request(|reply| Command::RemoveBinding { routing_key, reply }).await?
    }

    /// Registers the one delivery callback, silently replacing any previous one.
    pub async fn set_delivery_callback<F>(&self, callback: F) -> Result<(), RelayError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.send_callback(Some(Arc::new(callback))).await
    }

    pub async fn clear_delivery_callback(&self) -> Result<(), RelayError> {
        self.send_callback(None).await
    }

    async fn send_callback(&self, callback: Option<DeliveryCallback>) -> Result<(), RelayError> {
        self.commands
            .send(Command::SetCallback { callback })
            .await
            .map_err(|_| RelayError::Stopped)
    }

    /// Fire-and-forget publish. `Ok(false)` means the relay was not connected and
    /// nothing was sent.
    pub async fn publish(&self, routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Result<bool, RelayError> {
        let routing_key = routing_key.into();
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            routing_key,
            payload,
            reply,
        })
        .await?
    }

    pub async fn last_delivery(&self) -> Result<Option<Bytes>, RelayError> {
        self.request(|reply| Command::LastDelivery { reply }).await
    }

    /// Stops consuming and closes the broker session. Safe to call repeatedly; the
    /// relay can `connect` again afterwards.
    pub async fn dispose(&self) {
        if self.request(|reply| Command::Dispose { reply }).await.is_err() {
            tracing::debug!("Relay task already gone");
        }
    }

    pub fn state(&self) -> RelayState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), RelayState::Consuming { .. })
    }

    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }
}
