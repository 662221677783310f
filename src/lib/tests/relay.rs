use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::broker::{FailPoint, MemoryBroker};
use crate::config::{BrokerConfig, RelayConfig};
use crate::core::{Delivery, ExchangeKind, QueueOptions, RelayError};
use crate::relay::{dispatch_queue, DispatchQueue, InlineDispatcher, MessageRelay, RelayState};

const EXCHANGE: &str = "barter.test";

fn relay_config(kind: ExchangeKind) -> RelayConfig {
    RelayConfig {
        broker: BrokerConfig {
            exchange: EXCHANGE.to_string(),
            exchange_kind: kind,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn spawn_relay(broker: &MemoryBroker, kind: ExchangeKind) -> (MessageRelay, DispatchQueue) {
    let (dispatcher, queue) = dispatch_queue();
    let relay = MessageRelay::spawn(relay_config(kind), Arc::new(broker.clone()), Arc::new(dispatcher));
    (relay, queue)
}

async fn collect_into(relay: &MessageRelay) -> Result<mpsc::UnboundedReceiver<Delivery>, RelayError> {
    let (tx, rx) = mpsc::unbounded_channel();
    relay
        .set_delivery_callback(move |delivery| {
            let _ = tx.send(delivery);
        })
        .await?;
    Ok(rx)
}

async fn wait_for_acks(broker: &MemoryBroker, queue: &str, expected: u64) -> bool {
    for _ in 0..200 {
        if broker.acked_count(queue).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_open_channels(broker: &MemoryBroker, expected: usize) -> bool {
    for _ in 0..200 {
        if broker.open_channels().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn run_one(queue: &mut DispatchQueue) -> bool {
    tokio::time::timeout(Duration::from_secs(2), queue.run_next())
        .await
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Topic);

    let first = relay.connect(QueueOptions::named("user.u1")).await?;
    let second = relay.connect(QueueOptions::named("user.other")).await?;

    assert_eq!(first, "user.u1");
    assert_eq!(second, "user.u1");
    assert_eq!(broker.open_channels().await, 1);
    assert!(!broker.queue_exists("user.other").await);
    assert_eq!(relay.state(), RelayState::Consuming { queue: "user.u1".into() });
    assert!(relay.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_dispose_connect() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Direct);
    let options = QueueOptions::named("user.u1").durable(true);

    assert_eq!(relay.connect(options.clone()).await?, "user.u1");
    relay.dispose().await;
    assert_eq!(relay.state(), RelayState::Stopped);
    assert_eq!(broker.open_channels().await, 0);

    relay.dispose().await;
    assert_eq!(relay.state(), RelayState::Stopped);

    assert_eq!(relay.connect(options).await?, "user.u1");
    assert!(relay.is_running());
    assert_eq!(broker.open_channels().await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bound_key_delivers_once_and_unbound_key_none() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Topic);
    let mut received = collect_into(&relay).await?;
    let name = relay.connect(QueueOptions::named("user.u1")).await?;

    relay.add_binding("chat.u1").await?;
    assert!(relay.publish("chat.u1", "is the book still available?").await?);

    assert!(run_one(&mut queue).await);
    let delivery = received.try_recv()?;
    assert_eq!(delivery.routing_key, "chat.u1");
    assert_eq!(delivery.payload_str(), "is the book still available?");
    assert!(received.try_recv().is_err());
    assert!(wait_for_acks(&broker, &name, 1).await);

    relay.remove_binding("chat.u1").await?;
    assert!(relay.publish("chat.u1", "hello?").await?);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(queue.run_pending(), 0);
    assert!(received.try_recv().is_err());
    assert_eq!(broker.ready_count(&name).await, 0);
    assert_eq!(broker.acked_count(&name).await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_delivery_acked_exactly_once() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Direct);
    let mut received = collect_into(&relay).await?;
    let name = relay.connect(QueueOptions::named("user.u1")).await?;
    relay.add_binding("u1").await?;

    for i in 0..5 {
        relay.publish("u1", format!("message {i}")).await?;
    }
    for _ in 0..5 {
        assert!(run_one(&mut queue).await);
    }

    let mut payloads = Vec::new();
    while let Ok(delivery) = received.try_recv() {
        payloads.push(delivery.payload_str().into_owned());
    }
    assert_eq!(payloads, (0..5).map(|i| format!("message {i}")).collect::<Vec<_>>());
    assert!(wait_for_acks(&broker, &name, 5).await);
    assert_eq!(broker.unacked_count(&name).await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deliveries_without_callback_are_still_acked() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Direct);
    let name = relay.connect(QueueOptions::named("user.u1")).await?;
    relay.add_binding("u1").await?;

    relay.publish("u1", "nobody listening").await?;
    assert!(wait_for_acks(&broker, &name, 1).await);
    assert_eq!(queue.run_pending(), 0);
    assert_eq!(relay.last_delivery().await?.as_deref(), Some(&b"nobody listening"[..]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fanout_binds_default_key() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Fanout);
    let mut received = collect_into(&relay).await?;
    let name = relay.connect(QueueOptions::default().exclusive(true)).await?;

    assert!(name.starts_with("amq.gen-"));
    assert_eq!(broker.exchange_kind(EXCHANGE).await, Some(ExchangeKind::Fanout));
    assert_eq!(broker.route(EXCHANGE, "any.key").await, vec![name.clone()]);

    relay.publish("whatever", "broadcast").await?;
    assert!(run_one(&mut queue).await);
    assert_eq!(received.try_recv()?.payload_str(), "broadcast");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_setup_leaves_nothing_open() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Topic);

    broker.fail(FailPoint::Consume).await;
    let err = relay.connect(QueueOptions::named("user.u1").exclusive(true)).await.unwrap_err();
    assert!(matches!(err, RelayError::Protocol(_)));
    assert_eq!(relay.state(), RelayState::Idle);
    assert_eq!(broker.open_channels().await, 0);
    assert!(!broker.queue_exists("user.u1").await);
    assert!(!relay.publish("chat.u1", "dropped").await?);

    broker.heal(FailPoint::Consume).await;
    assert_eq!(relay.connect(QueueOptions::named("user.u1")).await?, "user.u1");
    assert!(relay.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_broker_reports_connection_error() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    broker.set_reachable(false).await;
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Topic);

    let err = relay.connect(QueueOptions::named("user.u1")).await.unwrap_err();
    assert!(matches!(err, RelayError::Connection(_)));
    assert_eq!(relay.state(), RelayState::Idle);

    broker.set_reachable(true).await;
    relay.connect(QueueOptions::named("user.u1")).await?;
    assert!(relay.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operations_before_connect() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Topic);

    assert_eq!(relay.state(), RelayState::Idle);
    assert!(!relay.publish("chat.u1", "too early").await?);
    assert_eq!(relay.add_binding("chat.u1").await, Err(RelayError::NotConnected));
    assert_eq!(relay.remove_binding("chat.u1").await, Err(RelayError::NotConnected));
    assert_eq!(relay.last_delivery().await?, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_binding_keeps_existing_bindings() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Topic);
    let mut received = collect_into(&relay).await?;
    let name = relay.connect(QueueOptions::named("user.u1")).await?;

    relay.add_binding("chat.a").await?;
    broker.fail(FailPoint::Bind).await;
    assert!(matches!(relay.add_binding("chat.b").await, Err(RelayError::Protocol(_))));
    broker.heal(FailPoint::Bind).await;

    assert_eq!(broker.route(EXCHANGE, "chat.a").await, vec![name.clone()]);
    assert!(broker.route(EXCHANGE, "chat.b").await.is_empty());

    relay.publish("chat.a", "still bound").await?;
    assert!(run_one(&mut queue).await);
    assert_eq!(received.try_recv()?.payload_str(), "still bound");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broker_drop_marks_relay_disconnected() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Topic);
    relay.connect(QueueOptions::named("user.u1")).await?;

    broker.disconnect_all().await;
    let mut state = relay.watch_state();
    let disconnected = tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| matches!(s, RelayState::Disconnected { .. })),
    )
    .await
    .map(|changed| changed.is_ok());
    assert_eq!(disconnected, Ok(true));
    assert!(!relay.is_running());
    assert!(!relay.publish("chat.u1", "lost").await?);

    relay.connect(QueueOptions::named("user.u1")).await?;
    assert!(relay.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replacing_callback_discards_previous() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Direct);
    let mut first = collect_into(&relay).await?;
    let mut second = collect_into(&relay).await?;
    relay.connect(QueueOptions::named("user.u1")).await?;
    relay.add_binding("u1").await?;

    relay.publish("u1", "only once").await?;
    assert!(run_one(&mut queue).await);
    assert!(first.try_recv().is_err());
    assert_eq!(second.try_recv()?.payload_str(), "only once");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_relays_exchange_messages() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (alice, _alice_queue) = spawn_relay(&broker, ExchangeKind::Topic);
    let bob = MessageRelay::spawn(
        relay_config(ExchangeKind::Topic),
        Arc::new(broker.clone()),
        Arc::new(InlineDispatcher),
    );
    let mut inbox = collect_into(&bob).await?;

    alice.connect(QueueOptions::named("user.alice")).await?;
    bob.connect(QueueOptions::named("user.bob")).await?;
    bob.add_binding("chat.*.bob").await?;

    alice.publish("chat.alice.bob", "want to swap books?").await?;
    alice.publish("chat.alice.carol", "not for bob").await?;

    let delivery = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await?;
    assert_eq!(delivery.map(|d| d.routing_key), Some("chat.alice.bob".to_string()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(inbox.try_recv().is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_handle_closes_session() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, _queue) = spawn_relay(&broker, ExchangeKind::Topic);
    relay.connect(QueueOptions::named("user.u1").auto_delete(true)).await?;
    assert_eq!(broker.open_channels().await, 1);

    drop(relay);
    assert!(wait_for_open_channels(&broker, 0).await);
    assert!(!broker.queue_exists("user.u1").await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_wait_keeps_consuming() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let (relay, mut queue) = spawn_relay(&broker, ExchangeKind::Direct);
    let mut received = collect_into(&relay).await?;
    let name = relay.connect(QueueOptions::named("user.u1")).await?;
    relay.add_binding("u1").await?;

    broker.interrupt_consumers().await;
    relay.publish("u1", "after the hiccup").await?;

    assert!(run_one(&mut queue).await);
    assert_eq!(received.try_recv()?.payload_str(), "after the hiccup");
    assert!(wait_for_acks(&broker, &name, 1).await);
    assert_eq!(broker.unacked_count(&name).await, 0);
    assert_eq!(relay.state(), RelayState::Consuming { queue: name });
    assert_eq!(broker.open_channels().await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_inline_callback_still_acks() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryBroker::new();
    let relay = MessageRelay::spawn(
        relay_config(ExchangeKind::Direct),
        Arc::new(broker.clone()),
        Arc::new(InlineDispatcher),
    );
    relay.set_delivery_callback(|_| panic!("bad callback")).await?;
    let name = relay.connect(QueueOptions::named("user.u1")).await?;
    relay.add_binding("u1").await?;

    relay.publish("u1", "first").await?;
    relay.publish("u1", "second").await?;
    assert!(wait_for_acks(&broker, &name, 2).await);
    assert!(relay.is_running());
    assert_eq!(relay.last_delivery().await?.as_deref(), Some(&b"second"[..]));
    Ok(())
}
