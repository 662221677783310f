use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{BrokerChannel, BrokerConnector, DeliveryStream};
use crate::config::BrokerConfig;
use crate::core::{Delivery, ExchangeKind, QueueOptions, RelayError, RoutingTable};

/// Broker operations a test can make fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Connect,
    DeclareExchange,
    DeclareQueue,
    Bind,
    Unbind,
    Consume,
    Publish,
    Ack,
}

#[derive(Clone)]
struct Envelope {
    routing_key: String,
    payload: Bytes,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    envelope: Envelope,
}

struct ConsumerState {
    channel: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery, RelayError>>,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    ready: VecDeque<Envelope>,
    consumer: Option<ConsumerState>,
    acked: u64,
}

struct BrokerState {
    reachable: bool,
    failures: HashSet<FailPoint>,
    exchanges: HashMap<String, RoutingTable>,
    queues: HashMap<String, QueueState>,
    open_channels: HashSet<u64>,
    next_channel: u64,
    next_tags: HashMap<u64, u64>,
    unacked: HashMap<(u64, u64), Unacked>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            failures: HashSet::new(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            open_channels: HashSet::new(),
            next_channel: 1,
            next_tags: HashMap::new(),
            unacked: HashMap::new(),
        }
    }
}

impl BrokerState {
    fn check(&self, channel: u64, point: FailPoint) -> Result<(), RelayError> {
        if !self.open_channels.contains(&channel) {
            return Err(RelayError::Connection(format!("channel {channel} is closed")));
        }
        if self.failures.contains(&point) {
            return Err(RelayError::Protocol(format!("{point:?} rejected by broker")));
        }
        Ok(())
    }

    fn deliver_or_enqueue(&mut self, queue_name: &str, envelope: Envelope) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(consumer) = &queue.consumer else {
            queue.ready.push_back(envelope);
            return;
        };

        let next_tag = self.next_tags.entry(consumer.channel).or_insert(1);
        let delivery_tag = *next_tag;
        *next_tag += 1;

        let delivery = Delivery {
            delivery_tag,
            routing_key: envelope.routing_key.clone(),
            redelivered: envelope.redelivered,
            payload: envelope.payload.clone(),
        };
        if consumer.sender.send(Ok(delivery)).is_err() {
            debug!(queue = %queue_name, tag = %consumer.tag, "Consumer went away, keeping message ready");
            queue.consumer = None;
            queue.ready.push_back(envelope);
            return;
        }
        let channel = consumer.channel;
        self.unacked.insert(
            (channel, delivery_tag),
            Unacked {
                queue: queue_name.to_string(),
                envelope,
            },
        );
    }

    fn flush_ready(&mut self, queue_name: &str) {
        let ready = match self.queues.get_mut(queue_name) {
            Some(queue) => std::mem::take(&mut queue.ready),
            None => return,
        };
        for envelope in ready {
            self.deliver_or_enqueue(queue_name, envelope);
        }
    }

    fn close_channel(&mut self, channel: u64) {
        if !self.open_channels.remove(&channel) {
            return;
        }

        let mut consumed_here = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel == channel) {
                queue.consumer = None;
                consumed_here.push(name.clone());
            }
        }

        let mut returned = self
            .unacked
            .keys()
            .filter(|(owner, _)| *owner == channel)
            .copied()
            .collect::<Vec<_>>();
        returned.sort_unstable();
        let mut requeued = HashSet::new();
        for key in returned.into_iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&key) {
                unacked.envelope.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(unacked.envelope);
                    requeued.insert(unacked.queue);
                }
            }
        }
        self.next_tags.remove(&channel);
        for queue in &requeued {
            self.flush_ready(queue);
        }

        let doomed = self
            .queues
            .iter()
            .filter(|(name, queue)| {
                (queue.options.exclusive && queue.owner == channel)
                    || (queue.options.auto_delete && consumed_here.contains(*name))
            })
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for name in doomed {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for table in self.exchanges.values_mut() {
            table.remove_queue(name);
        }
        self.unacked.retain(|_, unacked| unacked.queue != name);
    }
}

/// In-process broker with exchange, queue and binding semantics close to AMQP 0-9-1.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.inner.lock().await.reachable = reachable;
    }

    pub async fn fail(&self, point: FailPoint) {
        self.inner.lock().await.failures.insert(point);
    }

    pub async fn heal(&self, point: FailPoint) {
        self.inner.lock().await.failures.remove(&point);
    }

    /// Closes every open channel as if the broker dropped its connections.
    pub async fn disconnect_all(&self) {
        let mut state = self.inner.lock().await;
        let channels = state.open_channels.iter().copied().collect::<Vec<_>>();
        for channel in channels {
            state.close_channel(channel);
        }
    }

    /// Makes every active consumer observe one failed wait. The consumers stay attached.
    pub async fn interrupt_consumers(&self) {
        let state = self.inner.lock().await;
        for (name, queue) in &state.queues {
            if let Some(consumer) = &queue.consumer {
                let interrupted = RelayError::Interrupted(format!("wait on '{name}' interrupted"));
                if consumer.sender.send(Err(interrupted)).is_err() {
                    debug!(queue = %name, tag = %consumer.tag, "Consumer already gone");
                }
            }
        }
    }

    pub async fn open_channels(&self) -> usize {
        self.inner.lock().await.open_channels.len()
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock().await.queues.contains_key(queue)
    }

    pub async fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.inner.lock().await.exchanges.get(exchange).map(RoutingTable::kind)
    }

    /// Queues a publish with `routing_key` on `exchange` would reach.
    pub async fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let state = self.inner.lock().await;
        state
            .exchanges
            .get(exchange)
            .map(|table| table.route(routing_key))
            .unwrap_or_default()
    }

    pub async fn acked_count(&self, queue: &str) -> u64 {
        self.inner.lock().await.queues.get(queue).map_or(0, |q| q.acked)
    }

    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.inner.lock().await;
        state.unacked.values().filter(|u| u.queue == queue).count()
    }

    pub async fn ready_count(&self, queue: &str) -> usize {
        self.inner.lock().await.queues.get(queue).map_or(0, |q| q.ready.len())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(&self, _config: &BrokerConfig) -> Result<Box<dyn BrokerChannel>, RelayError> {
        let mut state = self.inner.lock().await;
        if !state.reachable {
            return Err(RelayError::Connection("broker unreachable".to_string()));
        }
        if state.failures.contains(&FailPoint::Connect) {
            return Err(RelayError::Connection("access refused".to_string()));
        }
        let id = state.next_channel;
        state.next_channel += 1;
        state.open_channels.insert(id);
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            id,
        }))
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<(), RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::DeclareExchange)?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind() != kind => Err(RelayError::Protocol(format!(
                "PRECONDITION_FAILED - exchange {name} already declared as {}",
                existing.kind()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), RoutingTable::new(kind));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<String, RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::DeclareQueue)?;
        let name = if options.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            options.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options.exclusive && existing.owner != self.id {
                return Err(RelayError::Protocol(format!(
                    "RESOURCE_LOCKED - queue {name} is exclusive to another connection"
                )));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options: QueueOptions {
                    name: name.clone(),
                    ..options.clone()
                },
                owner: self.id,
                ready: VecDeque::new(),
                consumer: None,
                acked: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::Bind)?;
        if !state.queues.contains_key(queue) {
            return Err(RelayError::Protocol(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let table = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RelayError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'")))?;
        table.bind(routing_key, queue);
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::Unbind)?;
        let table = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RelayError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'")))?;
        table.unbind(routing_key, queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::Consume)?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| RelayError::Protocol(format!("NOT_FOUND - no queue '{queue}'")))?;
        if entry.consumer.is_some() {
            return Err(RelayError::Protocol(format!(
                "ACCESS_REFUSED - queue '{queue}' already has a consumer"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        entry.consumer = Some(ConsumerState {
            channel: self.id,
            tag: consumer_tag.to_string(),
            sender,
        });
        state.flush_ready(queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::Publish)?;
        let queues = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| RelayError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'")))?
            .route(routing_key);

        let envelope = Envelope {
            routing_key: routing_key.to_string(),
            payload: Bytes::copy_from_slice(payload),
            redelivered: false,
        };
        for queue in queues {
            state.deliver_or_enqueue(&queue, envelope.clone());
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RelayError> {
        let mut state = self.broker.inner.lock().await;
        state.check(self.id, FailPoint::Ack)?;
        let unacked = state.unacked.remove(&(self.id, delivery_tag)).ok_or_else(|| {
            RelayError::Protocol(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
        })?;
        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            queue.acked += 1;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.broker.inner.lock().await.close_channel(self.id);
        Ok(())
    }
}
