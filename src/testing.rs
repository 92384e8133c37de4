// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Routes publishes to bound queues by exact exchange and routing key match,
//! hands them to the live subscription of that queue (or holds them until
//! one appears) and records every declaration, publish and settlement.

use crate::{
    broker::{
        Acker, BrokerChannel, BrokerConnection, CloseNotification, Connector, Delivery,
        DeliveryStream,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::FieldTable;
use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn orders_topology() -> Topology {
    Topology::new("orders")
        .kind(ExchangeKind::Direct)
        .queue("orders.created")
        .routing_key("order.created")
        .dead_letter("orders.dlx", "orders.dlq", "order.failed")
}

/// Polls `cond` every 10ms of (usually paused) time, panicking after a minute.
pub(crate) async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(60);
    while !cond().await {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack(u64),
    Reject { tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    pub at: Instant,
}

type Subscriber = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Default)]
struct BrokerState {
    failing_dials: usize,
    dials: usize,
    failing_declares: Vec<String>,
    failing_publishes: bool,
    stalled_publishes: bool,
    connections: Vec<Arc<FakeConnection>>,
    channels: Vec<Arc<FakeChannel>>,
    declarations: Vec<String>,
    bindings: Vec<QueueBinding>,
    published: Vec<Published>,
    settlements: Vec<Settlement>,
    prefetch: Vec<u16>,
    subscriptions: usize,
    pending: VecDeque<(String, Delivery)>,
    next_tag: u64,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_next_dials(&self, count: usize) {
        self.state().failing_dials = count;
    }

    pub(crate) fn fail_declare(&self, name: &str) {
        self.state().failing_declares.push(name.to_owned());
    }

    /// While set, open channels reject every publish.
    pub(crate) fn fail_publishes(&self, failing: bool) {
        self.state().failing_publishes = failing;
    }

    /// Publishes never complete, as with a broker that stops confirming.
    pub(crate) fn stall_publishes(&self) {
        self.state().stalled_publishes = true;
    }

    pub(crate) fn dials(&self) -> usize {
        self.state().dials
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    pub(crate) fn declarations(&self) -> Vec<String> {
        self.state().declarations.clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub(crate) fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    pub(crate) fn prefetch(&self) -> Vec<u16> {
        self.state().prefetch.clone()
    }

    pub(crate) fn subscriptions(&self) -> usize {
        self.state().subscriptions
    }

    /// Simulates the broker dropping the latest connection, which also
    /// takes its channel down.
    pub(crate) fn kill_connection(&self, reason: &str) {
        let (connection, channel) = {
            let state = self.state();
            (state.connections.last().cloned(), state.channels.last().cloned())
        };

        if let Some(channel) = channel {
            channel.shut(None);
        }
        if let Some(connection) = connection {
            connection.shut(Some(reason));
        }
    }

    /// Simulates a channel-level error on the latest channel.
    pub(crate) fn kill_channel(&self, reason: &str) {
        let channel = self.state().channels.last().cloned();
        if let Some(channel) = channel {
            channel.shut(Some(reason));
        }
    }

    /// Broker-side consumer cancellation: ends the delivery streams of the
    /// latest channel without closing it.
    pub(crate) fn cancel_consumers(&self) {
        let channel = self.state().channels.last().cloned();
        if let Some(channel) = channel {
            channel.subscribers.lock().unwrap().clear();
        }
    }

    /// Enqueues a message directly on `queue`.
    pub(crate) fn deliver(&self, queue: &str, routing_key: &str, body: &[u8], headers: FieldTable) {
        let delivery = self.new_delivery("", routing_key, body.to_vec(), headers);
        self.dispatch(queue, delivery);
    }

    pub(crate) fn new_delivery(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: FieldTable,
    ) -> Delivery {
        let tag = {
            let mut state = self.state();
            state.next_tag += 1;
            state.next_tag
        };

        Delivery::new(
            tag,
            exchange,
            routing_key,
            body,
            headers,
            Arc::new(FakeAcker {
                tag,
                broker: self.clone(),
            }),
        )
    }

    fn dispatch(&self, queue: &str, delivery: Delivery) {
        let channels = self.state().channels.clone();

        for channel in channels.iter().rev() {
            if !channel.open.load(Ordering::SeqCst) {
                continue;
            }
            let mut subscribers = channel.subscribers.lock().unwrap();
            subscribers.retain(|(_, tx)| !tx.is_closed());
            if let Some((_, tx)) = subscribers.iter().find(|(q, _)| q == queue) {
                if tx.send(Ok(delivery.clone())).is_ok() {
                    return;
                }
            }
        }

        self.state().pending.push_back((queue.to_owned(), delivery));
    }

    fn route(&self, exchange: &str, routing_key: &str, envelope: &Envelope) {
        let queues: Vec<String> = self
            .state()
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange && b.routing_key == routing_key)
            .map(|b| b.queue_name.clone())
            .collect();

        for queue in queues {
            let delivery = self.new_delivery(
                exchange,
                routing_key,
                envelope.body.clone(),
                envelope.headers.clone(),
            );
            self.dispatch(&queue, delivery);
        }
    }
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), AmqpError> {
        let mut state = self.state();
        state.dials += 1;

        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            open: AtomicBool::new(true),
            close_tx: Mutex::new(None),
        });
        let channel = Arc::new(FakeChannel {
            open: AtomicBool::new(true),
            close_tx: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            broker: self.clone(),
        });

        state.connections.push(connection.clone());
        state.channels.push(channel.clone());

        Ok((connection, channel))
    }
}

pub(crate) struct FakeConnection {
    open: AtomicBool,
    close_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl FakeConnection {
    fn shut(&self, reason: Option<&str>) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(reason) = reason {
            if let Some(tx) = self.close_tx.lock().unwrap().take() {
                let _ = tx.send(reason.to_owned());
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        *self.close_tx.lock().unwrap() = Some(tx);
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    open: AtomicBool,
    close_tx: Mutex<Option<oneshot::Sender<String>>>,
    subscribers: Mutex<Vec<(String, Subscriber)>>,
    broker: FakeBroker,
}

impl FakeChannel {
    fn shut(&self, reason: Option<&str>) {
        self.open.store(false, Ordering::SeqCst);
        self.subscribers.lock().unwrap().clear();
        if let Some(reason) = reason {
            if let Some(tx) = self.close_tx.lock().unwrap().take() {
                let _ = tx.send(reason.to_owned());
            }
        }
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }

    fn declare(&self, entry: String, name: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if state.failing_declares.iter().any(|n| n == name) {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }
        state.declarations.push(entry);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        *self.close_tx.lock().unwrap() = Some(tx);
        rx
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.declare(format!("exchange:{}", def.name), &def.name)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.declare(format!("queue:{}", def.name), &def.name)
            .map_err(|_| AmqpError::DeclareQueueError(def.name.clone()))
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.declare(
            format!(
                "bind:{}->{}:{}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            ),
            &binding.queue_name,
        )?;
        let mut state = self.broker.state();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state().prefetch.push(count);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let pending: Vec<Delivery> = {
            let mut state = self.broker.state();
            state.subscriptions += 1;
            let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                state.pending.drain(..).partition(|(q, _)| q == queue);
            state.pending = rest;
            matching.into_iter().map(|(_, d)| d).collect()
        };
        for delivery in pending {
            let _ = tx.send(Ok(delivery));
        }

        self.subscribers
            .lock()
            .unwrap()
            .push((queue.to_owned(), tx));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError("channel closed".to_owned()));
        }

        let (failing, stalled) = {
            let state = self.broker.state();
            (state.failing_publishes, state.stalled_publishes)
        };
        if failing {
            return Err(AmqpError::PublishingError("NOT_FOUND - no exchange".to_owned()));
        }
        if stalled {
            std::future::pending::<()>().await;
        }

        self.broker.state().published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            envelope: envelope.clone(),
            at: Instant::now(),
        });
        self.broker.route(exchange, routing_key, envelope);

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.subscribers.lock().unwrap().clear();
        Ok(())
    }
}

struct FakeAcker {
    tag: u64,
    broker: FakeBroker,
}

#[async_trait]
impl Acker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.state().settlements.push(Settlement::Ack(self.tag));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.state().settlements.push(Settlement::Reject {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}
